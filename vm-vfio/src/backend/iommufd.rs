//! 基于句柄的后端实现（iommufd）
//!
//! 一个后端实例对应一个 IOAS；设备经 cdev 绑定后直接挂到
//! IOAS（或带脏页跟踪能力的 HWPT）。没有组 fd 的概念，组归属
//! 只用于注册表侧的拓扑校验。

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, RawFd};

use vm_vfio_sys::device::DeviceFd;
use vm_vfio_sys::iommufd::Iommufd;

use super::{BackendKind, DirtyCaps, GroupHandle, IommuBackend, OpenedDevice, SetupInfo};
use crate::error::{Result, VfioError};

pub struct IommufdBackend {
    fd: Iommufd,
    ioas_id: u32,
    /// 已分配的硬件页表（脏页跟踪按表下发）
    hwpts: Vec<u32>,
    host_page_size: u64,
}

impl IommufdBackend {
    pub fn new() -> Result<Self> {
        let fd = Iommufd::open().map_err(|source| VfioError::kernel("iommufd", source))?;
        let ioas_id = fd
            .ioas_alloc()
            .map_err(|source| VfioError::kernel("iommufd", source))?;
        // SAFETY: sysconf 对常量参数总是安全的
        let host_page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        log::info!("iommufd backend ready, ioas={ioas_id}");
        Ok(Self {
            fd,
            ioas_id,
            hwpts: Vec::new(),
            host_page_size,
        })
    }

    fn label(&self) -> String {
        format!("ioas {}", self.ioas_id)
    }
}

impl IommuBackend for IommufdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Iommufd
    }

    fn iommu_type(&self) -> &'static str {
        "iommufd"
    }

    fn attach_group(&mut self, group: &GroupHandle) -> Result<()> {
        // cdev 模式没有组级容器操作，挂接发生在 open_device
        match group {
            GroupHandle::Kernel(_) => Err(VfioError::NotSupported("group fd on iommufd backend")),
            _ => Ok(()),
        }
    }

    fn detach_group(&mut self, _group: &GroupHandle) {}

    fn setup(&mut self) -> Result<SetupInfo> {
        let (ranges, alignment) = self
            .fd
            .iova_ranges(self.ioas_id)
            .map_err(|source| VfioError::kernel(self.label(), source))?;
        let page_size = alignment.max(self.host_page_size);
        Ok(SetupInfo {
            page_size_mask: page_size,
            iova_ranges: ranges,
            requires_windows: false,
            dirty: DirtyCaps {
                supported: true,
                page_size,
                max_bitmap_size: 0,
            },
        })
    }

    fn dma_map(&mut self, iova: u64, size: u64, vaddr: u64, readonly: bool) -> Result<()> {
        self.fd
            .map(self.ioas_id, iova, size, vaddr, readonly)
            .map_err(|source| VfioError::kernel(format!("iova {iova:#x}"), source))
    }

    fn dma_unmap(&mut self, iova: u64, size: u64) -> Result<u64> {
        self.fd
            .unmap(self.ioas_id, iova, size)
            .map_err(|source| VfioError::kernel(format!("iova {iova:#x}"), source))
    }

    fn dma_unmap_bitmap(
        &mut self,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> Result<u64> {
        // iommufd 没有原子的 unmap+位图变体：先取位图再解除映射。
        // 跟踪仍在进行，两步之间新产生的脏页会在下一次查询补上。
        self.query_dirty_bitmap(iova, size, page_size, bitmap)?;
        self.dma_unmap(iova, size)
    }

    fn set_dirty_tracking(&mut self, start: bool) -> Result<()> {
        for &hwpt in &self.hwpts {
            self.fd.set_dirty_tracking(hwpt, start).map_err(|source| {
                VfioError::kernel(format!("hwpt {hwpt} dirty tracking start={start}"), source)
            })?;
        }
        Ok(())
    }

    fn query_dirty_bitmap(
        &mut self,
        iova: u64,
        size: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> Result<()> {
        let mut scratch = vec![0u64; bitmap.len()];
        for &hwpt in &self.hwpts {
            scratch.fill(0);
            self.fd
                .get_dirty_bitmap(hwpt, iova, size, page_size, &mut scratch)
                .map_err(|source| VfioError::kernel(format!("hwpt {hwpt}"), source))?;
            for (dst, src) in bitmap.iter_mut().zip(&scratch) {
                *dst |= *src;
            }
        }
        Ok(())
    }

    fn add_window(&mut self, _size: u64, _page_shift: u32) -> Result<u64> {
        Err(VfioError::NotSupported("DMA windows on iommufd backend"))
    }

    fn del_window(&mut self, _start: u64) -> Result<()> {
        Err(VfioError::NotSupported("DMA windows on iommufd backend"))
    }

    fn open_device(&mut self, _group: &GroupHandle, name: &str) -> Result<OpenedDevice> {
        let sysfs = vm_vfio_sys::sysfs::device_sysfs_path(name);
        let cdev = vm_vfio_sys::sysfs::device_cdev_path(&sysfs).map_err(|source| {
            VfioError::Discovery {
                device: name.to_string(),
                source,
            }
        })?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&cdev)
            .map_err(|err| VfioError::Discovery {
                device: name.to_string(),
                source: vm_vfio_sys::SysError::Io(err),
            })?;
        let fd = DeviceFd::new(file);

        let devid = fd
            .bind_iommufd(self.fd.as_raw_fd())
            .map_err(|source| VfioError::kernel(name.to_string(), source))?;

        // 先尝试带脏页跟踪能力的硬件页表，失败退回直接挂 IOAS
        let mut hwpt_id = None;
        let mut dirty_precise = false;
        match self.fd.hwpt_alloc(devid, self.ioas_id, true) {
            Ok(id) => {
                fd.attach_iommufd_pt(id)
                    .map_err(|source| VfioError::kernel(name.to_string(), source))?;
                self.hwpts.push(id);
                hwpt_id = Some(id);
                dirty_precise = true;
            }
            Err(err) => {
                log::debug!("hwpt with dirty tracking unavailable for {name}: {err}");
                fd.attach_iommufd_pt(self.ioas_id)
                    .map_err(|source| VfioError::kernel(name.to_string(), source))?;
            }
        }

        let info = fd
            .get_info()
            .map_err(|source| VfioError::kernel(name.to_string(), source))?;
        Ok(OpenedDevice {
            fd: Some(fd),
            num_regions: info.num_regions,
            num_irqs: info.num_irqs,
            reset_works: info.reset,
            is_pci: info.is_pci,
            dirty_precise,
            hwpt_id,
        })
    }

    fn close_device(&mut self, device: &OpenedDevice) {
        if let Some(fd) = &device.fd {
            if let Err(err) = fd.detach_iommufd_pt() {
                log::warn!("detach from iommufd page table failed: {err}");
            }
        }
        if let Some(hwpt) = device.hwpt_id {
            self.hwpts.retain(|&id| id != hwpt);
            if let Err(err) = self.fd.destroy(hwpt) {
                log::warn!("destroy hwpt {hwpt} failed: {err}");
            }
        }
    }

    fn pci_hot_reset(&mut self, target: Option<&DeviceFd>, fds: &[RawFd]) -> Result<()> {
        let target = target
            .ok_or_else(|| VfioError::StateCorruption("hot reset without device fd".into()))?;
        // cdev 变体在同一 FAM 中传参与设备的 fd
        target
            .pci_hot_reset(fds)
            .map_err(|source| VfioError::kernel("hot reset", source))
    }

    fn release(&mut self) {
        for hwpt in self.hwpts.drain(..) {
            if let Err(err) = self.fd.destroy(hwpt) {
                log::warn!("destroy hwpt {hwpt} failed: {err}");
            }
        }
        if let Err(err) = self.fd.destroy(self.ioas_id) {
            log::warn!("destroy ioas {} failed: {err}", self.ioas_id);
        }
    }
}
