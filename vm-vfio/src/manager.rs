//! 直通核心对上层的门面
//!
//! 设备仿真层与内存模型只跟这一个类型打交道：挂接/脱离、区域
//! 通知、显式 map/unmap、脏页跟踪、热复位、能力查询。所有调用
//! 都默认运行在嵌入方的单一大锁之下，本层不再加锁。

use std::collections::HashMap;
use std::os::fd::RawFd;

use vm_vfio_sys::device::DependentDevice;

use crate::backend::{BackendFactory, BackendKind, KernelBackendFactory};
use crate::device::{Capability, CapabilityValue, Device, DeviceManager};
use crate::dirty::{self, HostDirtyBitmap};
use crate::dma::{self, MemorySection};
use crate::error::{Result, VfioError};
use crate::registry::Registry;
use crate::{AddressSpaceId, ContainerId};

#[cfg(feature = "kvm")]
use crate::hypervisor::KvmVfioBridge;

/// 直通核心的静态配置
#[derive(Debug, Clone, Copy)]
pub struct PassthroughConfig {
    /// 后端偏好；None 时探测宿主并取最新可用代际
    pub backend: Option<BackendKind>,
    /// 宿主页大小；0 时从系统查询
    pub host_page_size: u64,
    /// 是否把组 fd 通告给 KVM（仅 legacy 后端有组 fd）
    pub kvm_hint: bool,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            backend: None,
            host_page_size: 0,
            kvm_hint: true,
        }
    }
}

/// 客体 IOMMU 翻译结果到宿主地址的求解
///
/// 仿真层持有地址空间模型，这里只拿到最终结论：普通 RAM 后备
/// 的返回宿主虚拟地址，其他后备（设备 BAR 等）返回 None。
pub trait AddressResolver {
    fn resolve_ram(&self, guest_addr: u64, size: u64) -> Option<u64>;
}

pub struct PassthroughManager {
    registry: Registry,
    devices: DeviceManager,
    host_page_size: u64,
    kvm_hint: bool,
    /// 每个地址空间当前生效的区域，供迟到的容器回放
    sections: HashMap<AddressSpaceId, Vec<MemorySection>>,
    #[cfg(feature = "kvm")]
    kvm: Option<KvmVfioBridge>,
}

fn host_page_size() -> u64 {
    // Safety: sysconf 无内存副作用
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 0x1000 } else { size as u64 }
}

impl PassthroughManager {
    pub fn new(config: PassthroughConfig) -> Self {
        let kind = config.backend.unwrap_or_else(BackendKind::detect_best);
        Self::with_factory(config, Box::new(KernelBackendFactory::new(kind)))
    }

    pub fn with_factory(config: PassthroughConfig, factory: Box<dyn BackendFactory>) -> Self {
        Self {
            registry: Registry::new(factory),
            devices: DeviceManager::new(),
            host_page_size: if config.host_page_size == 0 {
                host_page_size()
            } else {
                config.host_page_size
            },
            kvm_hint: config.kvm_hint,
            sections: HashMap::new(),
            #[cfg(feature = "kvm")]
            kvm: None,
        }
    }

    /// 接上 KVM 的 VFIO 伪设备（可选，失败由调用方决定去留）
    #[cfg(feature = "kvm")]
    pub fn enable_kvm_hint(&mut self, vm: &kvm_ioctls::VmFd) -> Result<()> {
        self.kvm = Some(KvmVfioBridge::new(vm)?);
        Ok(())
    }

    /// 挂接设备；新容器出现时回放该地址空间的全部既有区域
    pub fn attach(
        &mut self,
        name: &str,
        space: AddressSpaceId,
        ram_discard_allowed: bool,
    ) -> Result<()> {
        let before: Vec<ContainerId> = self.registry.containers_of(space).to_vec();
        self.devices
            .attach(&mut self.registry, name, space, ram_discard_allowed)?;

        let new_containers: Vec<ContainerId> = self
            .registry
            .containers_of(space)
            .iter()
            .copied()
            .filter(|c| !before.contains(c))
            .collect();
        for cid in new_containers {
            self.replay_sections(cid, space)?;
        }
        self.kvm_group_hint(name, true);
        Ok(())
    }

    /// 脱离设备；容器被级联拆除时丢弃其区域簿记
    pub fn detach(&mut self, name: &str) -> Result<()> {
        self.kvm_group_hint(name, false);
        self.devices.detach(&mut self.registry, name)?;
        Ok(())
    }

    fn replay_sections(&mut self, cid: ContainerId, space: AddressSpaceId) -> Result<()> {
        let sections = self.sections.get(&space).cloned().unwrap_or_default();
        if sections.is_empty() {
            return Ok(());
        }
        log::debug!("replaying {} sections into container {cid:?}", sections.len());
        let container = self.registry.container_mut(cid)?;
        for section in &sections {
            dma::region_added(container, section, self.host_page_size)?;
        }
        Ok(())
    }

    #[cfg(feature = "kvm")]
    fn kvm_group_hint(&self, name: &str, add: bool) {
        if !self.kvm_hint {
            return;
        }
        let Some(kvm) = &self.kvm else { return };
        let Ok(device) = self.devices.device(name) else { return };
        let Ok(group) = self.registry.group(device.group) else { return };
        if let Some(fd) = group.handle.raw_fd() {
            if add {
                kvm.add_group(fd);
            } else {
                kvm.del_group(fd);
            }
        }
    }

    #[cfg(not(feature = "kvm"))]
    fn kvm_group_hint(&self, _name: &str, _add: bool) {}

    /// 一段客体内存区域生效
    pub fn on_region_added(&mut self, space: AddressSpaceId, section: MemorySection) -> Result<()> {
        self.sections.entry(space).or_default().push(section);
        let ids: Vec<ContainerId> = self.registry.containers_of(space).to_vec();
        for cid in ids {
            let container = self.registry.container_mut(cid)?;
            dma::region_added(container, &section, self.host_page_size)?;
        }
        Ok(())
    }

    /// 一段客体内存区域失效
    pub fn on_region_removed(
        &mut self,
        space: AddressSpaceId,
        section: MemorySection,
    ) -> Result<()> {
        if let Some(list) = self.sections.get_mut(&space) {
            list.retain(|s| !(s.iova == section.iova && s.size == section.size));
        }
        let ids: Vec<ContainerId> = self.registry.containers_of(space).to_vec();
        for cid in ids {
            let container = self.registry.container_mut(cid)?;
            dma::region_removed(container, &section, self.host_page_size)?;
        }
        Ok(())
    }

    /// 显式单笔映射（设备仿真层的直接入口）
    pub fn dma_map(
        &mut self,
        container: ContainerId,
        iova: u64,
        size: u64,
        host_ptr: u64,
        readonly: bool,
    ) -> Result<()> {
        dma::map_one(self.registry.container_mut(container)?, iova, size, host_ptr, readonly)
    }

    pub fn dma_unmap(&mut self, container: ContainerId, iova: u64, size: u64) -> Result<u64> {
        dma::unmap_one(self.registry.container_mut(container)?, iova, size)
    }

    pub fn set_dirty_tracking(&mut self, container: ContainerId, start: bool) -> Result<()> {
        dirty::set_tracking(self.registry.container_mut(container)?, start)
    }

    pub fn query_dirty_bitmap(
        &mut self,
        container: ContainerId,
        iova: u64,
        size: u64,
    ) -> Result<HostDirtyBitmap> {
        dirty::query_bitmap(
            self.registry.container_mut(container)?,
            iova,
            size,
            self.host_page_size,
        )
    }

    /// RAM-discard 后备区域的填充通知
    pub fn on_populate(&mut self, space: AddressSpaceId, iova: u64, size: u64) -> Result<()> {
        let ids: Vec<ContainerId> = self.registry.containers_of(space).to_vec();
        for cid in ids {
            dma::notify_populate(self.registry.container_mut(cid)?, iova, size)?;
        }
        Ok(())
    }

    /// RAM-discard 后备区域的丢弃通知
    pub fn on_discard(&mut self, space: AddressSpaceId, iova: u64, size: u64) -> Result<()> {
        let ids: Vec<ContainerId> = self.registry.containers_of(space).to_vec();
        for cid in ids {
            dma::notify_discard(self.registry.container_mut(cid)?, iova, size)?;
        }
        Ok(())
    }

    /// 客体 IOMMU 翻译通知：一笔虚拟 DMA 事务
    ///
    /// `translation` 为 Some((客体地址, 只读)) 表示建立映射，经
    /// 求解器换成宿主地址；非 RAM 后备的翻译结果一律拒绝。None
    /// 表示翻译失效，解除映射。
    pub fn on_iommu_notify(
        &mut self,
        space: AddressSpaceId,
        iova: u64,
        size: u64,
        translation: Option<(u64, bool)>,
        resolver: &dyn AddressResolver,
    ) -> Result<()> {
        let translated = match translation {
            Some((guest_addr, readonly)) => {
                let Some(vaddr) = resolver.resolve_ram(guest_addr, size) else {
                    log::error!(
                        "IOMMU translation {guest_addr:#x}+{size:#x} does not target RAM, refusing to map"
                    );
                    return Err(VfioError::NotSupported("DMA to non-RAM translation target"));
                };
                Some((vaddr, readonly))
            }
            None => None,
        };
        let ids: Vec<ContainerId> = self.registry.containers_of(space).to_vec();
        for cid in ids {
            dma::iommu_notify(self.registry.container_mut(cid)?, iova, size, translated)?;
        }
        Ok(())
    }

    /// 对目标设备执行协调热复位
    pub fn pci_hot_reset(&mut self, name: &str, single: bool) -> Result<()> {
        crate::reset::hot_reset(&mut self.registry, &mut self.devices, name, single, discover)
    }

    /// 复位所有带待复位标记的设备（总线复位回调）
    pub fn reset_all_needed(&mut self) -> Result<()> {
        crate::reset::reset_all_needed(&mut self.registry, &mut self.devices, discover)
    }

    pub fn get_capability(&self, name: &str, cap: Capability) -> Result<CapabilityValue> {
        self.devices.get_capability(&self.registry, name, cap)
    }

    /// 登记某中断索引的触发 fd（设备型别仿真层的中断装配入口）
    pub fn set_irq_trigger(&mut self, name: &str, index: u32, fds: Vec<RawFd>) -> Result<()> {
        self.devices.set_irq_trigger(name, index, fds)
    }

    pub fn clear_irq_trigger(&mut self, name: &str, index: u32) -> Result<()> {
        self.devices.clear_irq_trigger(name, index)
    }

    /// 多设备热迁移是否被当前设备组合挡住
    ///
    /// 不止一个设备、且有设备不支持精确脏页跟踪时，迁移流无法
    /// 保证一致性，由上层据此挂迁移阻塞器。
    pub fn migration_blocked(&self) -> bool {
        self.devices.devices.len() > 1
            && self
                .devices
                .devices
                .values()
                .any(|d| !d.inner.dirty_precise)
    }

    pub fn device(&self, name: &str) -> Result<&Device> {
        self.devices.device(name)
    }

    pub fn device_container(&self, name: &str) -> Result<ContainerId> {
        Ok(self.devices.device(name)?.container)
    }
}

/// 真实内核路径的复位域发现
fn discover(device: &Device) -> Result<Vec<DependentDevice>> {
    let fd = device.inner.fd.as_ref().ok_or_else(|| {
        VfioError::StateCorruption(format!("device {} has no open fd", device.name))
    })?;
    fd.pci_hot_reset_info()
        .map_err(|source| VfioError::kernel(device.name.clone(), source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{new_shared, MockFactory, MockOp, SharedMock};
    use crate::dma::SectionBacking;

    fn manager_with_mock() -> (PassthroughManager, SharedMock) {
        let state = new_shared();
        let mut groups = HashMap::new();
        groups.insert("0000:01:00.0".to_string(), 11);
        groups.insert("0000:02:00.0".to_string(), 22);
        let factory = MockFactory {
            state: state.clone(),
            groups,
        };
        let config = PassthroughConfig {
            backend: None,
            host_page_size: 0x1000,
            kvm_hint: false,
        };
        (PassthroughManager::with_factory(config, Box::new(factory)), state)
    }

    fn ram(iova: u64, size: u64, host_addr: u64) -> MemorySection {
        MemorySection {
            iova,
            size,
            host_addr,
            readonly: false,
            backing: SectionBacking::Ram,
        }
    }

    #[test]
    fn test_existing_sections_replayed_into_new_container() {
        let (mut manager, state) = manager_with_mock();
        let space = AddressSpaceId(0);
        manager.attach("0000:01:00.0", space, true).unwrap();
        manager.on_region_added(space, ram(0, 0x10000, 0x7f00_0000)).unwrap();

        // 第二个组与既有容器不兼容，新容器必须看到既有区域
        state.borrow_mut().attach_errors.push_back(Some(libc::EINVAL));
        manager.attach("0000:02:00.0", space, true).unwrap();

        let maps = state
            .borrow()
            .ops
            .iter()
            .filter(|op| matches!(op, MockOp::Map { iova: 0, size: 0x10000, .. }))
            .count();
        assert_eq!(maps, 2);
    }

    #[test]
    fn test_region_lifecycle_reaches_all_containers() {
        let (mut manager, state) = manager_with_mock();
        let space = AddressSpaceId(0);
        manager.attach("0000:01:00.0", space, true).unwrap();
        manager.on_region_added(space, ram(0x1000, 0x1000, 0x7f00_0000)).unwrap();
        manager.on_region_removed(space, ram(0x1000, 0x1000, 0x7f00_0000)).unwrap();
        let ops = state.borrow().ops.clone();
        assert!(ops.contains(&MockOp::Map { iova: 0x1000, size: 0x1000, readonly: false }));
        assert!(ops.contains(&MockOp::Unmap { iova: 0x1000, size: 0x1000 }));
    }

    #[test]
    fn test_dirty_query_without_start_makes_no_kernel_call() {
        let (mut manager, state) = manager_with_mock();
        let space = AddressSpaceId(0);
        manager.attach("0000:01:00.0", space, true).unwrap();
        let container = manager.device_container("0000:01:00.0").unwrap();
        let before = state.borrow().ops.len();
        let err = manager.query_dirty_bitmap(container, 0, 0x10000).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(state.borrow().ops.len(), before);
    }

    #[test]
    fn test_dirty_tracking_roundtrip() {
        let (mut manager, _state) = manager_with_mock();
        let space = AddressSpaceId(0);
        manager.attach("0000:01:00.0", space, true).unwrap();
        let container = manager.device_container("0000:01:00.0").unwrap();
        manager.set_dirty_tracking(container, true).unwrap();
        let bitmap = manager.query_dirty_bitmap(container, 0, 0x10000).unwrap();
        assert_eq!(bitmap.dirty_pages(), 0);
        manager.set_dirty_tracking(container, false).unwrap();
    }

    struct RamOnlyResolver;
    impl AddressResolver for RamOnlyResolver {
        fn resolve_ram(&self, guest_addr: u64, _size: u64) -> Option<u64> {
            (guest_addr < 0x8000_0000).then_some(0x7f00_0000 + guest_addr)
        }
    }

    #[test]
    fn test_iommu_notify_rejects_non_ram_target() {
        let (mut manager, state) = manager_with_mock();
        let space = AddressSpaceId(0);
        manager.attach("0000:01:00.0", space, true).unwrap();
        manager
            .on_region_added(
                space,
                MemorySection {
                    iova: 0,
                    size: 0x1000_0000,
                    host_addr: 0,
                    readonly: false,
                    backing: SectionBacking::GuestIommu,
                },
            )
            .unwrap();

        manager
            .on_iommu_notify(space, 0x4000, 0x1000, Some((0x2000, false)), &RamOnlyResolver)
            .unwrap();
        let err = manager
            .on_iommu_notify(space, 0x5000, 0x1000, Some((0x9000_0000, false)), &RamOnlyResolver)
            .unwrap_err();
        assert!(matches!(err, VfioError::NotSupported(_)));
        // 拒绝的翻译没有产生任何 map 调用
        let maps = state
            .borrow()
            .ops
            .iter()
            .filter(|op| matches!(op, MockOp::Map { iova: 0x5000, .. }))
            .count();
        assert_eq!(maps, 0);
    }

    #[test]
    fn test_migration_blocked_aggregation() {
        let (mut manager, state) = manager_with_mock();
        manager.attach("0000:01:00.0", AddressSpaceId(0), true).unwrap();
        assert!(!manager.migration_blocked());
        state.borrow_mut().device_dirty_precise = false;
        manager.attach("0000:02:00.0", AddressSpaceId(0), true).unwrap();
        assert!(manager.migration_blocked());
    }

    #[test]
    fn test_detach_tears_everything_down() {
        let (mut manager, _state) = manager_with_mock();
        let space = AddressSpaceId(0);
        manager.attach("0000:01:00.0", space, true).unwrap();
        manager.on_region_added(space, ram(0, 0x10000, 0x7f00_0000)).unwrap();
        manager.detach("0000:01:00.0").unwrap();
        assert!(manager.registry.containers.is_empty());
        assert!(manager.registry.groups.is_empty());
        // 区域簿记仍在，等下一个容器回放
        assert_eq!(manager.sections[&space].len(), 1);
    }
}
