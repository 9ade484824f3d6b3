//! 基于组的后端实现（type1 / sPAPR 容器）
//!
//! 容器 fd 上按降序偏好探测 IOMMU 类型；sPAPR v2 类型要求显式
//! 协商 DMA 窗口，页表层数从 1 逐级加大直到内核接受表大小。

use std::os::fd::RawFd;

use vfio_bindings::bindings::vfio::{VFIO_SPAPR_TCE_v2_IOMMU, VFIO_TYPE1_IOMMU, VFIO_TYPE1v2_IOMMU};
use vm_vfio_sys::device::DeviceFd;
use vm_vfio_sys::legacy::ContainerFd;

use super::{BackendKind, DirtyCaps, GroupHandle, IommuBackend, OpenedDevice, SetupInfo};
use crate::error::{Result, VfioError};

/// 探测顺序：新类型优先
const IOMMU_TYPE_PREFERENCE: [(u32, &str); 3] = [
    (VFIO_TYPE1v2_IOMMU, "type1v2"),
    (VFIO_TYPE1_IOMMU, "type1"),
    (VFIO_SPAPR_TCE_v2_IOMMU, "spapr-v2"),
];

/// 窗口协商时尝试的最大页表层数
const MAX_WINDOW_LEVELS: u32 = 5;

pub struct LegacyBackend {
    container: ContainerFd,
    iommu_type: Option<(u32, &'static str)>,
    migration_supported: bool,
}

impl LegacyBackend {
    /// 打开 /dev/vfio/vfio 并确定将启用的 IOMMU 类型
    pub fn new() -> Result<Self> {
        let container =
            ContainerFd::open().map_err(|source| VfioError::kernel("container", source))?;

        let mut iommu_type = None;
        for (type_id, label) in IOMMU_TYPE_PREFERENCE {
            match container.check_extension(type_id) {
                Ok(true) => {
                    iommu_type = Some((type_id, label));
                    break;
                }
                Ok(false) => {}
                Err(source) => return Err(VfioError::kernel("container", source)),
            }
        }
        if iommu_type.is_none() {
            return Err(VfioError::NotSupported("any known IOMMU type"));
        }

        Ok(Self {
            container,
            iommu_type,
            migration_supported: false,
        })
    }

    fn type_tag(&self) -> (u32, &'static str) {
        // new() 保证已探测出类型
        self.iommu_type.unwrap_or((VFIO_TYPE1_IOMMU, "type1"))
    }
}

impl IommuBackend for LegacyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn iommu_type(&self) -> &'static str {
        self.type_tag().1
    }

    fn attach_group(&mut self, group: &GroupHandle) -> Result<()> {
        match group {
            GroupHandle::Kernel(fd) => fd
                .set_container(&self.container)
                .map_err(|source| VfioError::kernel(format!("group {}", fd.id()), source)),
            _ => Err(VfioError::NotSupported("legacy backend without group fd")),
        }
    }

    fn detach_group(&mut self, group: &GroupHandle) {
        if let GroupHandle::Kernel(fd) = group {
            if let Err(err) = fd.unset_container() {
                log::warn!("failed to detach group {} from container: {err}", fd.id());
            }
        }
    }

    fn setup(&mut self) -> Result<SetupInfo> {
        let (type_id, label) = self.type_tag();
        self.container
            .set_iommu(type_id)
            .map_err(|source| VfioError::kernel("container", source))?;
        log::info!("container IOMMU type set to {label}");

        let info = self
            .container
            .iommu_info()
            .map_err(|source| VfioError::kernel("container", source))?;
        self.migration_supported = info.migration.is_some();

        let dirty = match info.migration {
            Some(cap) => DirtyCaps {
                supported: true,
                // 位图粒度取内核支持的最小页，折算损失最小
                page_size: smallest_page_size(cap.pgsize_bitmap),
                max_bitmap_size: cap.max_dirty_bitmap_size,
            },
            None => DirtyCaps::default(),
        };

        Ok(SetupInfo {
            page_size_mask: info.iova_pgsizes,
            iova_ranges: info.iova_ranges,
            requires_windows: type_id == VFIO_SPAPR_TCE_v2_IOMMU,
            dirty,
        })
    }

    fn dma_map(&mut self, iova: u64, size: u64, vaddr: u64, readonly: bool) -> Result<()> {
        self.container
            .map_dma(iova, size, vaddr, readonly)
            .map_err(|source| VfioError::kernel(format!("iova {iova:#x}"), source))
    }

    fn dma_unmap(&mut self, iova: u64, size: u64) -> Result<u64> {
        self.container
            .unmap_dma(iova, size)
            .map_err(|source| VfioError::kernel(format!("iova {iova:#x}"), source))
    }

    fn dma_unmap_bitmap(
        &mut self,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> Result<u64> {
        self.container
            .unmap_dma_bitmap(iova, size, page_size, bitmap)
            .map_err(|source| VfioError::kernel(format!("iova {iova:#x}"), source))
    }

    fn set_dirty_tracking(&mut self, start: bool) -> Result<()> {
        self.container.set_dirty_tracking(start).map_err(|source| {
            // 明确报告尝试设置的方向，内核版本差异靠它诊断
            VfioError::kernel(format!("dirty tracking start={start}"), source)
        })
    }

    fn query_dirty_bitmap(
        &mut self,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> Result<()> {
        self.container
            .get_dirty_bitmap(iova, size, page_size, bitmap)
            .map_err(|source| VfioError::kernel(format!("iova {iova:#x}"), source))
    }

    fn add_window(&mut self, size: u64, page_shift: u32) -> Result<u64> {
        // 层数逐级加大：内核以 EINVAL/E2BIG 拒绝放不下的页表布局
        let mut last_err = None;
        for levels in 1..=MAX_WINDOW_LEVELS {
            match self.container.create_window(size, page_shift, levels) {
                Ok(start) => {
                    log::debug!(
                        "window created: start={start:#x} size={size:#x} shift={page_shift} levels={levels}"
                    );
                    return Ok(start);
                }
                Err(source) => {
                    let errno = source.errno();
                    last_err = Some(VfioError::kernel(format!("window size {size:#x}"), source));
                    if errno != Some(libc::EINVAL) && errno != Some(libc::E2BIG) {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(VfioError::NotSupported("DMA window creation")))
    }

    fn del_window(&mut self, start: u64) -> Result<()> {
        self.container
            .remove_window(start)
            .map_err(|source| VfioError::kernel(format!("window {start:#x}"), source))
    }

    fn open_device(&mut self, group: &GroupHandle, name: &str) -> Result<OpenedDevice> {
        let GroupHandle::Kernel(group_fd) = group else {
            return Err(VfioError::NotSupported("legacy backend without group fd"));
        };
        let file = group_fd
            .get_device_fd(name)
            .map_err(|source| VfioError::kernel(name.to_string(), source))?;
        let fd = DeviceFd::new(file);
        let info = fd
            .get_info()
            .map_err(|source| VfioError::kernel(name.to_string(), source))?;

        // 精确跟踪：设备自带 DMA 记录 feature，或容器报告迁移能力
        let dirty_precise = fd.dma_logging_supported() || self.migration_supported;

        Ok(OpenedDevice {
            fd: Some(fd),
            num_regions: info.num_regions,
            num_irqs: info.num_irqs,
            reset_works: info.reset,
            is_pci: info.is_pci,
            dirty_precise,
            hwpt_id: None,
        })
    }

    fn close_device(&mut self, _device: &OpenedDevice) {
        // legacy 路径设备 fd 关闭即完成
    }

    fn pci_hot_reset(&mut self, target: Option<&DeviceFd>, fds: &[RawFd]) -> Result<()> {
        let target = target
            .ok_or_else(|| VfioError::StateCorruption("hot reset without device fd".into()))?;
        target
            .pci_hot_reset(fds)
            .map_err(|source| VfioError::kernel("hot reset", source))
    }

    fn release(&mut self) {
        log::debug!("releasing legacy container");
        // 容器 fd 随后端一起销毁时关闭
    }
}

fn smallest_page_size(mask: u64) -> u64 {
    if mask == 0 { 0 } else { 1u64 << mask.trailing_zeros() }
}
