//! IOMMU 后端抽象
//!
//! 两代内核 ABI（基于组的 type1 与基于句柄的 iommufd）收敛到
//! 一张固定的能力接口上，后端选择只发生在容器创建这一个点。
//! 其余子系统（注册表、DMA 引擎、脏页引擎、热复位）一律通过
//! `dyn IommuBackend` 调用，对后端代际无感。

use std::os::fd::RawFd;

use vm_vfio_sys::device::DeviceFd;
use vm_vfio_sys::legacy::GroupFd;

use crate::error::{Result, VfioError};

pub mod iommufd;
pub mod legacy;

pub use iommufd::IommufdBackend;
pub use legacy::LegacyBackend;

/// 后端代际
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// 基于组的旧接口（type1 / sPAPR 容器）
    Legacy,
    /// 基于句柄的新接口（iommufd）
    Iommufd,
}

impl BackendKind {
    /// 检测宿主上可用的最佳后端（新接口优先）
    pub fn detect_best() -> Self {
        if std::path::Path::new("/dev/iommu").exists() {
            return BackendKind::Iommufd;
        }
        BackendKind::Legacy
    }
}

/// 组句柄：legacy 后端持内核组 fd，iommufd cdev 模式没有组 fd
#[derive(Debug)]
pub enum GroupHandle {
    Kernel(GroupFd),
    None,
    #[cfg(test)]
    Mock(u32),
}

impl GroupHandle {
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            GroupHandle::Kernel(fd) => {
                use std::os::fd::AsRawFd;
                Some(fd.as_raw_fd())
            }
            _ => None,
        }
    }
}

/// 容器脏页跟踪能力
#[derive(Debug, Clone, Copy, Default)]
pub struct DirtyCaps {
    pub supported: bool,
    /// 内核规定的位图页粒度
    pub page_size: u64,
    pub max_bitmap_size: u64,
}

/// 后端一次性初始化的结果
#[derive(Debug, Clone, Default)]
pub struct SetupInfo {
    /// 内核支持的 IOMMU 页大小位掩码
    pub page_size_mask: u64,
    /// 可用 IOVA 范围（闭区间），空表示不受限
    pub iova_ranges: Vec<(u64, u64)>,
    /// 该后端要求显式协商 DMA 窗口
    pub requires_windows: bool,
    pub dirty: DirtyCaps,
}

/// 设备打开的结果（mock 后端没有真实 fd）
#[derive(Debug, Default)]
pub struct OpenedDevice {
    pub fd: Option<DeviceFd>,
    pub num_regions: u32,
    pub num_irqs: u32,
    pub reset_works: bool,
    pub is_pci: bool,
    /// 设备支持精确脏页跟踪；否则查询时整段保守置脏
    pub dirty_precise: bool,
    /// iommufd 后端为设备分配的硬件页表句柄
    pub hwpt_id: Option<u32>,
}

/// 统一的后端能力接口
///
/// 所有方法都是快速的非阻塞内核调用，绝不等待客体 I/O 完成。
pub trait IommuBackend {
    fn kind(&self) -> BackendKind;

    /// 已协商的 IOMMU 类型标签（日志与能力查询用）
    fn iommu_type(&self) -> &'static str;

    /// 尝试把组加入本后端实例；失败留给调用方另建容器
    fn attach_group(&mut self, group: &GroupHandle) -> Result<()>;

    /// 把组从本后端脱离（失败只记录，脱离流程不中断）
    fn detach_group(&mut self, group: &GroupHandle);

    /// 一次性初始化：IOMMU 类型启用、页大小与 IOVA 范围发现、
    /// 脏页能力发现。必须在第一个组挂入之后调用。
    fn setup(&mut self) -> Result<SetupInfo>;

    fn dma_map(&mut self, iova: u64, size: u64, vaddr: u64, readonly: bool) -> Result<()>;

    /// 返回内核实际解除的字节数
    fn dma_unmap(&mut self, iova: u64, size: u64) -> Result<u64>;

    /// 解除映射并取回该范围最终脏页位图（跟踪已开启时使用）
    fn dma_unmap_bitmap(
        &mut self,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> Result<u64>;

    fn set_dirty_tracking(&mut self, start: bool) -> Result<()>;

    fn query_dirty_bitmap(
        &mut self,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> Result<()>;

    /// 协商一个新的 DMA 窗口，返回内核选定的起始地址
    fn add_window(&mut self, size: u64, page_shift: u32) -> Result<u64>;

    fn del_window(&mut self, start: u64) -> Result<()>;

    /// 打开设备 fd 并查询其能力
    fn open_device(&mut self, group: &GroupHandle, name: &str) -> Result<OpenedDevice>;

    /// 关闭设备路径上的后端侧状态（iommufd 的 detach）
    fn close_device(&mut self, device: &OpenedDevice);

    /// 对复位域执行协调热复位；fds 的含义依代际而定
    /// （legacy：参与组的 fd；iommufd：参与设备的 fd）
    fn pci_hot_reset(&mut self, target: Option<&DeviceFd>, fds: &[RawFd]) -> Result<()>;

    /// 释放全部后端资源（容器/ioas 销毁前的最后一步）
    fn release(&mut self);
}

/// 后端与发现步骤的构造入口，容器创建时的唯一多态点
pub trait BackendFactory {
    /// 解析设备身份所属的内核组号
    fn resolve_group_id(&self, device: &str) -> Result<u32>;

    /// 打开组句柄（iommufd 模式返回 GroupHandle::None）
    fn open_group(&self, group_id: u32) -> Result<GroupHandle>;

    /// 新建一个后端实例（未 setup）
    fn new_backend(&self) -> Result<Box<dyn IommuBackend>>;
}

/// 真实内核后端工厂
pub struct KernelBackendFactory {
    kind: BackendKind,
}

impl KernelBackendFactory {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }
}

impl BackendFactory for KernelBackendFactory {
    fn resolve_group_id(&self, device: &str) -> Result<u32> {
        let path = vm_vfio_sys::sysfs::device_sysfs_path(device);
        vm_vfio_sys::sysfs::resolve_iommu_group(&path).map_err(|source| VfioError::Discovery {
            device: device.to_string(),
            source,
        })
    }

    fn open_group(&self, group_id: u32) -> Result<GroupHandle> {
        match self.kind {
            BackendKind::Legacy => {
                let fd = GroupFd::open(group_id)
                    .map_err(|source| VfioError::kernel(format!("group {group_id}"), source))?;
                Ok(GroupHandle::Kernel(fd))
            }
            BackendKind::Iommufd => Ok(GroupHandle::None),
        }
    }

    fn new_backend(&self) -> Result<Box<dyn IommuBackend>> {
        match self.kind {
            BackendKind::Legacy => Ok(Box::new(LegacyBackend::new()?)),
            BackendKind::Iommufd => Ok(Box::new(IommufdBackend::new()?)),
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! 记录式 mock 后端：单测注入，记录每次内核调用并可编程失败

    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockOp {
        AttachGroup(u32),
        DetachGroup(u32),
        Setup,
        Map { iova: u64, size: u64, readonly: bool },
        Unmap { iova: u64, size: u64 },
        UnmapBitmap { iova: u64, size: u64 },
        SetDirty(bool),
        QueryDirty { iova: u64, size: u64 },
        AddWindow { size: u64, page_shift: u32 },
        DelWindow { start: u64 },
        OpenDevice(String),
        CloseDevice,
        HotReset { fd_count: usize },
        Release,
    }

    #[derive(Default)]
    pub struct MockState {
        pub ops: Vec<MockOp>,
        /// 依次弹出的 map 结果（None = 成功，Some(errno) = 失败）
        pub map_errors: VecDeque<Option<i32>>,
        pub unmap_errors: VecDeque<Option<i32>>,
        pub attach_errors: VecDeque<Option<i32>>,
        pub window_errors: VecDeque<Option<i32>>,
        /// 下一个 add_window 返回的起始地址
        pub next_window_start: u64,
        pub dirty_supported: bool,
        pub requires_windows: bool,
        pub device_dirty_precise: bool,
    }

    pub type SharedMock = Rc<RefCell<MockState>>;

    pub fn new_shared() -> SharedMock {
        Rc::new(RefCell::new(MockState {
            dirty_supported: true,
            device_dirty_precise: true,
            ..Default::default()
        }))
    }

    pub struct MockBackend {
        pub state: SharedMock,
    }

    fn errno_result(errno: Option<i32>, op: &'static str) -> Result<()> {
        match errno {
            None => Ok(()),
            Some(errno) => Err(VfioError::kernel(
                "mock",
                vm_vfio_sys::SysError::Ioctl {
                    op,
                    source: std::io::Error::from_raw_os_error(errno),
                },
            )),
        }
    }

    impl IommuBackend for MockBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Legacy
        }

        fn iommu_type(&self) -> &'static str {
            "typeA-v2"
        }

        fn attach_group(&mut self, group: &GroupHandle) -> Result<()> {
            let id = match group {
                GroupHandle::Mock(id) => *id,
                _ => 0,
            };
            let mut state = self.state.borrow_mut();
            state.ops.push(MockOp::AttachGroup(id));
            let next = state.attach_errors.pop_front().flatten();
            drop(state);
            errno_result(next, "VFIO_GROUP_SET_CONTAINER")
        }

        fn detach_group(&mut self, group: &GroupHandle) {
            let id = match group {
                GroupHandle::Mock(id) => *id,
                _ => 0,
            };
            self.state.borrow_mut().ops.push(MockOp::DetachGroup(id));
        }

        fn setup(&mut self) -> Result<SetupInfo> {
            let mut state = self.state.borrow_mut();
            state.ops.push(MockOp::Setup);
            Ok(SetupInfo {
                page_size_mask: 0x1000,
                iova_ranges: Vec::new(),
                requires_windows: state.requires_windows,
                dirty: DirtyCaps {
                    supported: state.dirty_supported,
                    page_size: 0x1000,
                    max_bitmap_size: 256 * 1024 * 1024,
                },
            })
        }

        fn dma_map(&mut self, iova: u64, size: u64, _vaddr: u64, readonly: bool) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.ops.push(MockOp::Map { iova, size, readonly });
            let next = state.map_errors.pop_front().flatten();
            drop(state);
            errno_result(next, "VFIO_IOMMU_MAP_DMA")
        }

        fn dma_unmap(&mut self, iova: u64, size: u64) -> Result<u64> {
            let mut state = self.state.borrow_mut();
            state.ops.push(MockOp::Unmap { iova, size });
            let next = state.unmap_errors.pop_front().flatten();
            drop(state);
            errno_result(next, "VFIO_IOMMU_UNMAP_DMA")?;
            Ok(size)
        }

        fn dma_unmap_bitmap(
            &mut self,
            iova: u64,
            size: u64,
            _page_size: u64,
            bitmap: &mut [u64],
        ) -> Result<u64> {
            self.state.borrow_mut().ops.push(MockOp::UnmapBitmap { iova, size });
            bitmap.fill(0);
            Ok(size)
        }

        fn set_dirty_tracking(&mut self, start: bool) -> Result<()> {
            self.state.borrow_mut().ops.push(MockOp::SetDirty(start));
            Ok(())
        }

        fn query_dirty_bitmap(
            &mut self,
            iova: u64,
            size: u64,
            _page_size: u64,
            bitmap: &mut [u64],
        ) -> Result<()> {
            self.state.borrow_mut().ops.push(MockOp::QueryDirty { iova, size });
            bitmap.fill(0);
            Ok(())
        }

        fn add_window(&mut self, size: u64, page_shift: u32) -> Result<u64> {
            let mut state = self.state.borrow_mut();
            state.ops.push(MockOp::AddWindow { size, page_shift });
            let next = state.window_errors.pop_front().flatten();
            let start = state.next_window_start;
            drop(state);
            errno_result(next, "VFIO_IOMMU_SPAPR_TCE_CREATE")?;
            Ok(start)
        }

        fn del_window(&mut self, start: u64) -> Result<()> {
            self.state.borrow_mut().ops.push(MockOp::DelWindow { start });
            Ok(())
        }

        fn open_device(&mut self, _group: &GroupHandle, name: &str) -> Result<OpenedDevice> {
            let mut state = self.state.borrow_mut();
            state.ops.push(MockOp::OpenDevice(name.to_string()));
            Ok(OpenedDevice {
                fd: None,
                num_regions: 9,
                num_irqs: 5,
                reset_works: true,
                is_pci: true,
                dirty_precise: state.device_dirty_precise,
                hwpt_id: None,
            })
        }

        fn close_device(&mut self, _device: &OpenedDevice) {
            self.state.borrow_mut().ops.push(MockOp::CloseDevice);
        }

        fn pci_hot_reset(&mut self, _target: Option<&DeviceFd>, fds: &[std::os::fd::RawFd]) -> Result<()> {
            self.state
                .borrow_mut()
                .ops
                .push(MockOp::HotReset { fd_count: fds.len() });
            Ok(())
        }

        fn release(&mut self) {
            self.state.borrow_mut().ops.push(MockOp::Release);
        }
    }

    /// 注入 mock 后端的工厂
    pub struct MockFactory {
        pub state: SharedMock,
        /// 设备名 -> 组号
        pub groups: std::collections::HashMap<String, u32>,
    }

    impl BackendFactory for MockFactory {
        fn resolve_group_id(&self, device: &str) -> Result<u32> {
            self.groups
                .get(device)
                .copied()
                .ok_or_else(|| VfioError::Discovery {
                    device: device.to_string(),
                    source: vm_vfio_sys::SysError::InvalidSysfs(device.to_string()),
                })
        }

        fn open_group(&self, group_id: u32) -> Result<GroupHandle> {
            Ok(GroupHandle::Mock(group_id))
        }

        fn new_backend(&self) -> Result<Box<dyn IommuBackend>> {
            Ok(Box::new(MockBackend {
                state: Rc::clone(&self.state),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_detect_is_deterministic() {
        let first = BackendKind::detect_best();
        assert_eq!(first, BackendKind::detect_best());
    }

    #[test]
    fn test_group_handle_raw_fd_none_variants() {
        assert!(GroupHandle::None.raw_fd().is_none());
        assert!(GroupHandle::Mock(7).raw_fd().is_none());
    }
}
