//! 设备文件描述符上的 ioctl 封装
//!
//! 覆盖设备信息/区域/中断查询（含能力链解析）、设备复位、
//! PCI 热复位依赖发现与执行、以及基于设备 feature 的 DMA
//! 脏页记录（iommufd 后端的脏页跟踪路径）。

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};

use vfio_bindings::bindings::vfio::{
    VFIO_DEVICE_FLAGS_PCI, VFIO_DEVICE_FLAGS_RESET, VFIO_IRQ_SET_ACTION_TRIGGER,
    VFIO_IRQ_SET_DATA_EVENTFD, VFIO_IRQ_SET_DATA_NONE, VFIO_REGION_INFO_FLAG_CAPS,
    vfio_device_info, vfio_irq_info,
    vfio_irq_set, vfio_pci_dependent_device, vfio_pci_hot_reset, vfio_pci_hot_reset_info,
    vfio_region_info,
};

use crate::types::{
    VFIO_DEVICE_FEATURE_DMA_LOGGING_REPORT, VFIO_DEVICE_FEATURE_DMA_LOGGING_START,
    VFIO_DEVICE_FEATURE_DMA_LOGGING_STOP, VFIO_DEVICE_FEATURE_GET, VFIO_DEVICE_FEATURE_PROBE,
    VFIO_DEVICE_FEATURE_SET, vfio_cap_header, vfio_device_attach_iommufd_pt,
    vfio_device_bind_iommufd, vfio_device_detach_iommufd_pt, vfio_device_feature,
    vfio_device_feature_dma_logging_control, vfio_device_feature_dma_logging_range,
    vfio_device_feature_dma_logging_report,
};
use crate::{Result, check_ret, ioctl_mut, ioctl_none, vec_with_array_field};

const VFIO_REGION_INFO_CAP_SPARSE_MMAP: u16 = 1;
const VFIO_REGION_INFO_CAP_TYPE: u16 = 2;

/// 设备基本信息
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceInfo {
    pub num_regions: u32,
    pub num_irqs: u32,
    /// 设备支持 VFIO_DEVICE_RESET
    pub reset: bool,
    pub is_pci: bool,
}

/// 单个区域的解析结果
#[derive(Debug, Clone, Default)]
pub struct RegionInfo {
    pub index: u32,
    pub size: u64,
    pub offset: u64,
    pub flags: u32,
    /// 稀疏 mmap 子区间（offset, size）
    pub sparse_mmaps: Vec<(u64, u64)>,
    /// 区域类型能力（type, subtype），迁移区域据此识别
    pub cap_type: Option<(u32, u32)>,
}

/// 中断索引信息
#[derive(Debug, Clone, Copy, Default)]
pub struct IrqInfo {
    pub index: u32,
    pub count: u32,
    pub flags: u32,
}

/// 热复位依赖表中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependentDevice {
    pub group_id: u32,
    pub segment: u16,
    pub bus: u8,
    pub devfn: u8,
}

/// 内核表项转依赖记录
///
/// `group_id` 在 ABI 里与 `devid` 共用一个联合体，本路径不带
/// VFIO_PCI_HOT_RESET_FLAG_DEV_ID，联合体按组号解释。
fn parse_dependent_device(dev: &vfio_pci_dependent_device) -> DependentDevice {
    DependentDevice {
        // SAFETY: 未请求 DEV_ID 时内核填充的是 group_id
        group_id: unsafe { dev.__bindgen_anon_1.group_id },
        segment: dev.segment,
        bus: dev.bus,
        devfn: dev.devfn,
    }
}

/// 已打开的 VFIO 设备 fd
#[derive(Debug)]
pub struct DeviceFd {
    file: File,
}

impl DeviceFd {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn get_info(&self) -> Result<DeviceInfo> {
        let mut info = vfio_device_info {
            argsz: std::mem::size_of::<vfio_device_info>() as u32,
            ..Default::default()
        };
        ioctl_mut(
            &self.file,
            crate::VFIO_DEVICE_GET_INFO(),
            &mut info,
            "VFIO_DEVICE_GET_INFO",
        )?;
        Ok(DeviceInfo {
            num_regions: info.num_regions,
            num_irqs: info.num_irqs,
            reset: info.flags & VFIO_DEVICE_FLAGS_RESET != 0,
            is_pci: info.flags & VFIO_DEVICE_FLAGS_PCI != 0,
        })
    }

    /// 查询区域信息；带能力链时按 argsz 重试并解析稀疏 mmap 与类型能力
    pub fn region_info(&self, index: u32) -> Result<RegionInfo> {
        let mut info = vfio_region_info {
            argsz: std::mem::size_of::<vfio_region_info>() as u32,
            index,
            ..Default::default()
        };
        ioctl_mut(
            &self.file,
            crate::VFIO_DEVICE_GET_REGION_INFO(),
            &mut info,
            "VFIO_DEVICE_GET_REGION_INFO",
        )?;

        let mut result = RegionInfo {
            index,
            size: info.size,
            offset: info.offset,
            flags: info.flags,
            ..Default::default()
        };

        if info.flags & VFIO_REGION_INFO_FLAG_CAPS != 0
            && info.argsz as usize > std::mem::size_of::<vfio_region_info>()
        {
            let argsz = info.argsz as usize;
            let mut buf = vec![0u8; argsz];
            let header = buf.as_mut_ptr() as *mut vfio_region_info;
            // SAFETY: buf 至少 argsz 字节
            unsafe {
                (*header).argsz = argsz as u32;
                (*header).index = index;
            }
            // SAFETY: 内核按 argsz 填充缓冲区
            let ret = unsafe {
                vmm_sys_util::ioctl::ioctl_with_mut_ptr(
                    &self.file,
                    crate::VFIO_DEVICE_GET_REGION_INFO(),
                    header,
                )
            };
            check_ret(ret, "VFIO_DEVICE_GET_REGION_INFO")?;
            // SAFETY: 同上
            let (size, offset, flags, cap_offset) =
                unsafe { ((*header).size, (*header).offset, (*header).flags, (*header).cap_offset) };
            result.size = size;
            result.offset = offset;
            result.flags = flags;
            parse_region_caps(&buf, cap_offset, &mut result);
        }
        Ok(result)
    }

    pub fn irq_info(&self, index: u32) -> Result<IrqInfo> {
        let mut info = vfio_irq_info {
            argsz: std::mem::size_of::<vfio_irq_info>() as u32,
            index,
            ..Default::default()
        };
        ioctl_mut(
            &self.file,
            crate::VFIO_DEVICE_GET_IRQ_INFO(),
            &mut info,
            "VFIO_DEVICE_GET_IRQ_INFO",
        )?;
        Ok(IrqInfo {
            index: info.index,
            count: info.count,
            flags: info.flags,
        })
    }

    /// 屏蔽一个中断索引（热复位静默路径）
    pub fn disable_irq_index(&self, index: u32) -> Result<()> {
        let irq_set = vfio_irq_set {
            argsz: std::mem::size_of::<vfio_irq_set>() as u32,
            flags: VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
            index,
            start: 0,
            count: 0,
            ..Default::default()
        };
        crate::ioctl_ref(
            &self.file,
            crate::VFIO_DEVICE_SET_IRQS(),
            &irq_set,
            "VFIO_DEVICE_SET_IRQS",
        )?;
        Ok(())
    }

    /// 把一组 eventfd 挂到指定中断索引上并使能触发
    ///
    /// 复位编排恢复阶段用它把静默前登记的触发 fd 重新装回内核。
    pub fn enable_irq_index(&self, index: u32, trigger_fds: &[RawFd]) -> Result<()> {
        let count = trigger_fds.len();
        let mut irq_set = vec_with_array_field::<vfio_irq_set, i32>(count);
        irq_set[0].argsz =
            (std::mem::size_of::<vfio_irq_set>() + count * std::mem::size_of::<i32>()) as u32;
        irq_set[0].flags = VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER;
        irq_set[0].index = index;
        irq_set[0].start = 0;
        irq_set[0].count = count as u32;
        // SAFETY: irq_set[0] 之后有 count 个 i32 的空间
        unsafe {
            let data = irq_set[0].data.as_mut_slice(count * std::mem::size_of::<i32>());
            for (i, fd) in trigger_fds.iter().enumerate() {
                data[i * 4..(i + 1) * 4].copy_from_slice(&fd.to_ne_bytes());
            }
        }
        crate::ioctl_ref(
            &self.file,
            crate::VFIO_DEVICE_SET_IRQS(),
            &irq_set[0],
            "VFIO_DEVICE_SET_IRQS",
        )?;
        Ok(())
    }

    /// 单设备功能级复位
    pub fn reset(&self) -> Result<()> {
        ioctl_none(&self.file, crate::VFIO_DEVICE_RESET(), "VFIO_DEVICE_RESET")?;
        Ok(())
    }

    /// 查询共享复位域的设备列表（argsz 协议：首次取 count，再取全表）
    pub fn pci_hot_reset_info(&self) -> Result<Vec<DependentDevice>> {
        let mut probe = vfio_pci_hot_reset_info {
            argsz: std::mem::size_of::<vfio_pci_hot_reset_info>() as u32,
            ..Default::default()
        };
        // 首次调用预期 ENOSPC，内核在 count 中给出依赖设备数
        let ret = unsafe {
            vmm_sys_util::ioctl::ioctl_with_mut_ref(
                &self.file,
                crate::VFIO_DEVICE_GET_PCI_HOT_RESET_INFO(),
                &mut probe,
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::ENOSPC) {
                return Err(crate::SysError::Ioctl {
                    op: "VFIO_DEVICE_GET_PCI_HOT_RESET_INFO",
                    source: errno,
                });
            }
        }
        let count = probe.count as usize;

        let mut full =
            vec_with_array_field::<vfio_pci_hot_reset_info, vfio_pci_dependent_device>(count);
        full[0].argsz = (std::mem::size_of::<vfio_pci_hot_reset_info>()
            + count * std::mem::size_of::<vfio_pci_dependent_device>()) as u32;
        // SAFETY: full[0] 之后有 count 个元素的空间供内核填充
        let ret = unsafe {
            vmm_sys_util::ioctl::ioctl_with_mut_ref(
                &self.file,
                crate::VFIO_DEVICE_GET_PCI_HOT_RESET_INFO(),
                &mut full[0],
            )
        };
        check_ret(ret, "VFIO_DEVICE_GET_PCI_HOT_RESET_INFO")?;

        let reported = full[0].count.min(count as u32) as usize;
        // SAFETY: 内核填充了 reported 个尾随元素
        let devices = unsafe { full[0].devices.as_slice(reported) };
        Ok(devices.iter().map(parse_dependent_device).collect())
    }

    /// 对整个复位域执行一次协调热复位，传入全部参与组的 fd
    pub fn pci_hot_reset(&self, group_fds: &[RawFd]) -> Result<()> {
        let mut reset = vec_with_array_field::<vfio_pci_hot_reset, i32>(group_fds.len());
        reset[0].argsz = (std::mem::size_of::<vfio_pci_hot_reset>()
            + group_fds.len() * std::mem::size_of::<i32>()) as u32;
        reset[0].count = group_fds.len() as u32;
        // SAFETY: reset[0] 之后有 count 个 i32 的空间
        unsafe {
            reset[0]
                .group_fds
                .as_mut_slice(group_fds.len())
                .copy_from_slice(group_fds);
        }
        // SAFETY: 结构体已按 ABI 填充完毕
        let ret = unsafe {
            vmm_sys_util::ioctl::ioctl_with_ref(
                &self.file,
                crate::VFIO_DEVICE_PCI_HOT_RESET(),
                &reset[0],
            )
        };
        check_ret(ret, "VFIO_DEVICE_PCI_HOT_RESET")?;
        Ok(())
    }

    /// 探测设备是否支持 DMA 脏页记录 feature
    pub fn dma_logging_supported(&self) -> bool {
        let feature = vfio_device_feature {
            argsz: std::mem::size_of::<vfio_device_feature>() as u32,
            flags: VFIO_DEVICE_FEATURE_PROBE
                | VFIO_DEVICE_FEATURE_SET
                | VFIO_DEVICE_FEATURE_DMA_LOGGING_START,
        };
        crate::ioctl_ref(
            &self.file,
            crate::VFIO_DEVICE_FEATURE(),
            &feature,
            "VFIO_DEVICE_FEATURE",
        )
        .is_ok()
    }

    /// 启动设备级 DMA 脏页记录
    pub fn dma_logging_start(&self, ranges: &[(u64, u64)], page_size: u64) -> Result<()> {
        let abi_ranges: Vec<vfio_device_feature_dma_logging_range> = ranges
            .iter()
            .map(|&(iova, length)| vfio_device_feature_dma_logging_range { iova, length })
            .collect();

        #[repr(C)]
        #[derive(Default, Copy, Clone)]
        struct Request {
            feature: vfio_device_feature,
            control: vfio_device_feature_dma_logging_control,
        }
        let request = Request {
            feature: vfio_device_feature {
                argsz: std::mem::size_of::<Request>() as u32,
                flags: VFIO_DEVICE_FEATURE_SET | VFIO_DEVICE_FEATURE_DMA_LOGGING_START,
            },
            control: vfio_device_feature_dma_logging_control {
                page_size,
                num_ranges: abi_ranges.len() as u32,
                __reserved: 0,
                ranges: abi_ranges.as_ptr() as u64,
            },
        };
        crate::ioctl_ref(
            &self.file,
            crate::VFIO_DEVICE_FEATURE(),
            &request,
            "VFIO_DEVICE_FEATURE",
        )?;
        Ok(())
    }

    /// 停止设备级 DMA 脏页记录
    pub fn dma_logging_stop(&self) -> Result<()> {
        let feature = vfio_device_feature {
            argsz: std::mem::size_of::<vfio_device_feature>() as u32,
            flags: VFIO_DEVICE_FEATURE_SET | VFIO_DEVICE_FEATURE_DMA_LOGGING_STOP,
        };
        crate::ioctl_ref(
            &self.file,
            crate::VFIO_DEVICE_FEATURE(),
            &feature,
            "VFIO_DEVICE_FEATURE",
        )?;
        Ok(())
    }

    /// 取回一段范围的设备级脏页位图
    pub fn dma_logging_report(
        &self,
        iova: u64,
        length: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> Result<()> {
        #[repr(C)]
        #[derive(Default, Copy, Clone)]
        struct Request {
            feature: vfio_device_feature,
            report: vfio_device_feature_dma_logging_report,
        }
        let request = Request {
            feature: vfio_device_feature {
                argsz: std::mem::size_of::<Request>() as u32,
                flags: VFIO_DEVICE_FEATURE_GET | VFIO_DEVICE_FEATURE_DMA_LOGGING_REPORT,
            },
            report: vfio_device_feature_dma_logging_report {
                iova,
                length,
                page_size,
                bitmap: bitmap.as_mut_ptr() as u64,
            },
        };
        crate::ioctl_ref(
            &self.file,
            crate::VFIO_DEVICE_FEATURE(),
            &request,
            "VFIO_DEVICE_FEATURE",
        )?;
        Ok(())
    }

    /// 把 cdev 设备绑定到 iommufd，返回内核分配的 device id
    pub fn bind_iommufd(&self, iommufd: RawFd) -> Result<u32> {
        let mut bind = vfio_device_bind_iommufd {
            argsz: std::mem::size_of::<vfio_device_bind_iommufd>() as u32,
            flags: 0,
            iommufd,
            out_devid: 0,
        };
        ioctl_mut(
            &self.file,
            crate::VFIO_DEVICE_BIND_IOMMUFD(),
            &mut bind,
            "VFIO_DEVICE_BIND_IOMMUFD",
        )?;
        Ok(bind.out_devid)
    }

    /// 把设备挂到指定的 IOAS / HWPT
    pub fn attach_iommufd_pt(&self, pt_id: u32) -> Result<()> {
        let attach = vfio_device_attach_iommufd_pt {
            argsz: std::mem::size_of::<vfio_device_attach_iommufd_pt>() as u32,
            flags: 0,
            pt_id,
        };
        crate::ioctl_ref(
            &self.file,
            crate::VFIO_DEVICE_ATTACH_IOMMUFD_PT(),
            &attach,
            "VFIO_DEVICE_ATTACH_IOMMUFD_PT",
        )?;
        Ok(())
    }

    pub fn detach_iommufd_pt(&self) -> Result<()> {
        let detach = vfio_device_detach_iommufd_pt {
            argsz: std::mem::size_of::<vfio_device_detach_iommufd_pt>() as u32,
            flags: 0,
        };
        crate::ioctl_ref(
            &self.file,
            crate::VFIO_DEVICE_DETACH_IOMMUFD_PT(),
            &detach,
            "VFIO_DEVICE_DETACH_IOMMUFD_PT",
        )?;
        Ok(())
    }
}

impl AsRawFd for DeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// 解析区域信息的能力链（稀疏 mmap、区域类型）
fn parse_region_caps(buf: &[u8], mut offset: u32, out: &mut RegionInfo) {
    #[repr(C)]
    #[derive(Debug, Default, Copy, Clone)]
    struct SparseHeader {
        header: vfio_cap_header,
        nr_areas: u32,
        reserved: u32,
    }
    #[repr(C)]
    #[derive(Debug, Default, Copy, Clone)]
    struct SparseArea {
        offset: u64,
        size: u64,
    }
    #[repr(C)]
    #[derive(Debug, Default, Copy, Clone)]
    struct TypeCap {
        header: vfio_cap_header,
        type_: u32,
        subtype: u32,
    }

    while offset != 0 && (offset as usize) + std::mem::size_of::<vfio_cap_header>() <= buf.len() {
        // SAFETY: 边界已检查
        let header = unsafe {
            std::ptr::read_unaligned(buf.as_ptr().add(offset as usize) as *const vfio_cap_header)
        };
        match header.id {
            VFIO_REGION_INFO_CAP_SPARSE_MMAP => {
                let head_size = std::mem::size_of::<SparseHeader>();
                if offset as usize + head_size <= buf.len() {
                    // SAFETY: 边界已检查
                    let head = unsafe {
                        std::ptr::read_unaligned(
                            buf.as_ptr().add(offset as usize) as *const SparseHeader
                        )
                    };
                    let mut pos = offset as usize + head_size;
                    for _ in 0..head.nr_areas {
                        if pos + std::mem::size_of::<SparseArea>() > buf.len() {
                            break;
                        }
                        // SAFETY: 边界已检查
                        let area = unsafe {
                            std::ptr::read_unaligned(buf.as_ptr().add(pos) as *const SparseArea)
                        };
                        out.sparse_mmaps.push((area.offset, area.size));
                        pos += std::mem::size_of::<SparseArea>();
                    }
                }
            }
            VFIO_REGION_INFO_CAP_TYPE => {
                if offset as usize + std::mem::size_of::<TypeCap>() <= buf.len() {
                    // SAFETY: 边界已检查
                    let cap = unsafe {
                        std::ptr::read_unaligned(buf.as_ptr().add(offset as usize) as *const TypeCap)
                    };
                    out.cap_type = Some((cap.type_, cap.subtype));
                }
            }
            other => {
                log::debug!("ignoring unknown region capability {other}");
            }
        }
        if header.next <= offset {
            break;
        }
        offset = header.next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dependent_device_reads_group_union() {
        // SAFETY: 纯 POD 的 ABI 结构，全零是合法值
        let mut raw: vfio_pci_dependent_device = unsafe { std::mem::zeroed() };
        raw.segment = 0x1a;
        raw.bus = 3;
        raw.devfn = 0x10;
        raw.__bindgen_anon_1.group_id = 42;

        let dep = parse_dependent_device(&raw);
        assert_eq!(dep.group_id, 42);
        assert_eq!((dep.segment, dep.bus, dep.devfn), (0x1a, 3, 0x10));
    }

    #[test]
    fn test_parse_region_sparse_mmap() {
        let mut buf = vec![0u8; 32];
        let cap_offset = buf.len() as u32;
        // sparse 头 + 两个子区间，手工铺到字节缓冲区里
        buf.extend_from_slice(&1u16.to_ne_bytes()); // id
        buf.extend_from_slice(&1u16.to_ne_bytes()); // version
        buf.extend_from_slice(&0u32.to_ne_bytes()); // next
        buf.extend_from_slice(&2u32.to_ne_bytes()); // nr_areas
        buf.extend_from_slice(&0u32.to_ne_bytes()); // reserved
        for (off, size) in [(0u64, 0x1000u64), (0x2000, 0x800)] {
            buf.extend_from_slice(&off.to_ne_bytes());
            buf.extend_from_slice(&size.to_ne_bytes());
        }

        let mut info = RegionInfo::default();
        parse_region_caps(&buf, cap_offset, &mut info);
        assert_eq!(info.sparse_mmaps, vec![(0, 0x1000), (0x2000, 0x800)]);
        assert!(info.cap_type.is_none());
    }

    #[test]
    fn test_parse_region_type_cap() {
        let mut buf = vec![0u8; 32];
        let cap_offset = buf.len() as u32;
        buf.extend_from_slice(&2u16.to_ne_bytes()); // id = CAP_TYPE
        buf.extend_from_slice(&1u16.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&3u32.to_ne_bytes()); // type
        buf.extend_from_slice(&1u32.to_ne_bytes()); // subtype

        let mut info = RegionInfo::default();
        parse_region_caps(&buf, cap_offset, &mut info);
        assert_eq!(info.cap_type, Some((3, 1)));
    }
}
