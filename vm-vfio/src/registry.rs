//! 隔离域注册表
//!
//! 维护地址空间 → 容器 → 组的成员关系。组与容器不互持引用，
//! 全部关系用稳定键（内核组号、容器号）查表表达，容器在组列表
//! 变空时拆除，地址空间在容器列表变空时剪除。所有操作在嵌入方
//! 的单一大锁下串行执行，注册表内部不做并发。

use std::collections::HashMap;

use crate::backend::{BackendFactory, GroupHandle};
use crate::container::{Container, DirtyTrackingState};
use crate::error::{Result, VfioError};
use crate::{AddressSpaceId, ContainerId};

/// 一个硬件隔离单元的登记项
pub struct Group {
    /// 内核组号
    pub id: u32,
    pub address_space: AddressSpaceId,
    pub container: ContainerId,
    /// 成员设备身份（attach 顺序）
    pub devices: Vec<String>,
    /// RAM-discard 兼容策略：首个设备定调，None 表示尚无设备
    pub ram_discard_allowed: Option<bool>,
    pub handle: GroupHandle,
}

pub struct Registry {
    factory: Box<dyn BackendFactory>,
    pub containers: HashMap<ContainerId, Container>,
    /// 内核组号 -> 登记项
    pub groups: HashMap<u32, Group>,
    /// 地址空间 -> 其下的容器
    address_spaces: HashMap<AddressSpaceId, Vec<ContainerId>>,
    next_container: u64,
}

impl Registry {
    pub fn new(factory: Box<dyn BackendFactory>) -> Self {
        Self {
            factory,
            containers: HashMap::new(),
            groups: HashMap::new(),
            address_spaces: HashMap::new(),
            next_container: 0,
        }
    }

    pub fn resolve_group_id(&self, device: &str) -> Result<u32> {
        self.factory.resolve_group_id(device)
    }

    pub fn containers_of(&self, space: AddressSpaceId) -> &[ContainerId] {
        self.address_spaces
            .get(&space)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 取得或登记一个组，返回其容器号
    ///
    /// 同一内核组号被第二个地址空间请求是宿主拓扑错误，直接
    /// 拒绝，绝不静默合并。新登记的组先尝试加入该地址空间下的
    /// 既有容器，全部失败才新建容器并做一次性初始化。
    pub fn get_or_create_group(
        &mut self,
        group_id: u32,
        space: AddressSpaceId,
    ) -> Result<(ContainerId, bool)> {
        if let Some(group) = self.groups.get(&group_id) {
            if group.address_space != space {
                return Err(VfioError::GroupAddressSpaceConflict { group: group_id });
            }
            return Ok((group.container, false));
        }

        let handle = self.factory.open_group(group_id)?;
        self.connect_container(group_id, handle, space)
    }

    /// 把组挂入地址空间下的某个容器（必要时新建）
    fn connect_container(
        &mut self,
        group_id: u32,
        handle: GroupHandle,
        space: AddressSpaceId,
    ) -> Result<(ContainerId, bool)> {
        // 先试加入既有容器：内核层兼容（attach 成功）即共享
        let candidates: Vec<ContainerId> =
            self.address_spaces.get(&space).cloned().unwrap_or_default();
        for cid in candidates {
            let container = self
                .containers
                .get_mut(&cid)
                .ok_or_else(|| VfioError::StateCorruption(format!("container {cid:?} missing")))?;
            if container.setup_error.is_some() {
                continue;
            }
            if container.backend.attach_group(&handle).is_ok() {
                container.groups.push(group_id);
                self.groups.insert(
                    group_id,
                    Group {
                        id: group_id,
                        address_space: space,
                        container: cid,
                        devices: Vec::new(),
                        ram_discard_allowed: None,
                        handle,
                    },
                );
                log::info!("group {group_id} joined existing container {cid:?}");
                return Ok((cid, false));
            }
        }

        // 新建容器：打开后端、挂组、一次性初始化。任何一步失败
        // 都按逆序释放已取得的资源再返回。
        let mut backend = self.factory.new_backend()?;
        backend.attach_group(&handle).inspect_err(|_| {
            backend.release();
        })?;
        let setup = match backend.setup() {
            Ok(setup) => setup,
            Err(err) => {
                backend.detach_group(&handle);
                backend.release();
                return Err(err);
            }
        };

        let cid = ContainerId(self.next_container);
        self.next_container += 1;
        let iommu_type = backend.iommu_type();
        self.containers.insert(
            cid,
            Container {
                id: cid,
                address_space: space,
                backend,
                page_size_mask: setup.page_size_mask,
                iova_ranges: setup.iova_ranges,
                requires_windows: setup.requires_windows,
                windows: Vec::new(),
                groups: vec![group_id],
                mappings: std::collections::BTreeMap::new(),
                ram_discard_listeners: Vec::new(),
                iommu_notifiers: Vec::new(),
                dirty: DirtyTrackingState {
                    caps: setup.dirty,
                    started: false,
                },
                dirty_residual: Vec::new(),
                all_devices_dirty_precise: true,
                setup_error: None,
            },
        );
        self.address_spaces.entry(space).or_default().push(cid);
        self.groups.insert(
            group_id,
            Group {
                id: group_id,
                address_space: space,
                container: cid,
                devices: Vec::new(),
                ram_discard_allowed: None,
                handle,
            },
        );
        log::info!("group {group_id} attached to new container {cid:?} ({iommu_type})");
        Ok((cid, true))
    }

    /// 把组从其容器脱离；容器变空即拆除，地址空间变空即剪除
    ///
    /// 返回被拆除容器的号（调用方据此撤销区域登记）。
    pub fn disconnect_container(&mut self, group_id: u32) -> Result<Option<ContainerId>> {
        let group = self
            .groups
            .remove(&group_id)
            .ok_or_else(|| VfioError::StateCorruption(format!("group {group_id} not registered")))?;
        let cid = group.container;
        let container = self
            .containers
            .get_mut(&cid)
            .ok_or_else(|| VfioError::StateCorruption(format!("container {cid:?} missing")))?;

        container.backend.detach_group(&group.handle);
        container.groups.retain(|&g| g != group_id);
        if !container.groups.is_empty() {
            return Ok(None);
        }

        // 最后一个组走了：撤掉残余映射与窗口，释放后端
        let Some(mut container) = self.containers.remove(&cid) else {
            return Err(VfioError::StateCorruption(format!("container {cid:?} missing")));
        };
        let iovas: Vec<(u64, u64)> = container
            .mappings
            .iter()
            .map(|(&iova, rec)| (iova, rec.size))
            .collect();
        for (iova, size) in iovas {
            if let Err(err) = container.backend.dma_unmap(iova, size) {
                log::warn!("teardown unmap of {iova:#x}+{size:#x} failed: {err}");
            }
        }
        for window in std::mem::take(&mut container.windows) {
            if let Err(err) = container.backend.del_window(window.min_iova) {
                log::warn!("teardown window removal at {:#x} failed: {err}", window.min_iova);
            }
        }
        container.backend.release();
        if let Some(list) = self.address_spaces.get_mut(&group.address_space) {
            list.retain(|&c| c != cid);
            if list.is_empty() {
                self.address_spaces.remove(&group.address_space);
            }
        }
        log::info!("container {cid:?} destroyed (last group {group_id} detached)");
        Ok(Some(cid))
    }

    /// 经组所属容器的后端打开设备 fd
    pub fn open_device(
        &mut self,
        group_id: u32,
        name: &str,
    ) -> Result<crate::backend::OpenedDevice> {
        let group = self
            .groups
            .get(&group_id)
            .ok_or_else(|| VfioError::StateCorruption(format!("group {group_id} not registered")))?;
        let container = self
            .containers
            .get_mut(&group.container)
            .ok_or_else(|| VfioError::StateCorruption(format!("container {:?} missing", group.container)))?;
        container.backend.open_device(&group.handle, name)
    }

    /// 关闭设备路径上的后端侧状态
    pub fn close_device(&mut self, group_id: u32, device: &crate::backend::OpenedDevice) {
        if let Some(group) = self.groups.get(&group_id) {
            if let Some(container) = self.containers.get_mut(&group.container) {
                container.backend.close_device(device);
            }
        }
    }

    pub fn group(&self, group_id: u32) -> Result<&Group> {
        self.groups
            .get(&group_id)
            .ok_or_else(|| VfioError::StateCorruption(format!("group {group_id} not registered")))
    }

    pub fn group_mut(&mut self, group_id: u32) -> Result<&mut Group> {
        self.groups
            .get_mut(&group_id)
            .ok_or_else(|| VfioError::StateCorruption(format!("group {group_id} not registered")))
    }

    pub fn container(&self, id: ContainerId) -> Result<&Container> {
        self.containers
            .get(&id)
            .ok_or_else(|| VfioError::StateCorruption(format!("container {id:?} missing")))
    }

    pub fn container_mut(&mut self, id: ContainerId) -> Result<&mut Container> {
        self.containers
            .get_mut(&id)
            .ok_or_else(|| VfioError::StateCorruption(format!("container {id:?} missing")))
    }
}
