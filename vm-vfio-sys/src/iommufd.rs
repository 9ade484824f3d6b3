//! 基于句柄的内核接口（iommufd）
//!
//! /dev/iommu 上的对象式 ABI：IOAS（I/O 地址空间）与 HWPT
//! （硬件页表）通过数值句柄引用，设备经 cdev 绑定后挂接到
//! IOAS。结构体按 linux/iommufd.h 手工声明（尚无绑定 crate）。

#![allow(non_camel_case_types)]

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};

use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr};

use crate::{Result, ioctl_mut, ioctl_ref};

const IOMMUFD_PATH: &str = "/dev/iommu";
const IOMMUFD_TYPE: u32 = b';' as u32;

// 命令号直接取自 enum iommufd_cmd（基值 0x80），不加 VFIO_BASE
ioctl_io_nr!(IOMMU_DESTROY, IOMMUFD_TYPE, 0x80);
ioctl_io_nr!(IOMMU_IOAS_ALLOC, IOMMUFD_TYPE, 0x81);
ioctl_io_nr!(IOMMU_IOAS_IOVA_RANGES, IOMMUFD_TYPE, 0x84);
ioctl_io_nr!(IOMMU_IOAS_MAP, IOMMUFD_TYPE, 0x85);
ioctl_io_nr!(IOMMU_IOAS_UNMAP, IOMMUFD_TYPE, 0x86);
ioctl_io_nr!(IOMMU_HWPT_ALLOC, IOMMUFD_TYPE, 0x89);
ioctl_io_nr!(IOMMU_HWPT_SET_DIRTY_TRACKING, IOMMUFD_TYPE, 0x8b);
ioctl_io_nr!(IOMMU_HWPT_GET_DIRTY_BITMAP, IOMMUFD_TYPE, 0x8c);

pub const IOMMU_IOAS_MAP_FIXED_IOVA: u32 = 1 << 0;
pub const IOMMU_IOAS_MAP_WRITEABLE: u32 = 1 << 1;
pub const IOMMU_IOAS_MAP_READABLE: u32 = 1 << 2;
pub const IOMMU_HWPT_ALLOC_DIRTY_TRACKING: u32 = 1 << 1;
pub const IOMMU_HWPT_DIRTY_TRACKING_ENABLE: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_destroy {
    pub size: u32,
    pub id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_ioas_alloc {
    pub size: u32,
    pub flags: u32,
    pub out_ioas_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_iova_range {
    pub start: u64,
    pub last: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_ioas_iova_ranges {
    pub size: u32,
    pub ioas_id: u32,
    pub num_iovas: u32,
    pub __reserved: u32,
    pub allowed_iovas: u64,
    pub out_iova_alignment: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_ioas_map {
    pub size: u32,
    pub flags: u32,
    pub ioas_id: u32,
    pub __reserved: u32,
    pub user_va: u64,
    pub length: u64,
    pub iova: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_ioas_unmap {
    pub size: u32,
    pub ioas_id: u32,
    pub iova: u64,
    pub length: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_hwpt_alloc {
    pub size: u32,
    pub flags: u32,
    pub dev_id: u32,
    pub pt_id: u32,
    pub out_hwpt_id: u32,
    pub __reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_hwpt_set_dirty_tracking {
    pub size: u32,
    pub flags: u32,
    pub hwpt_id: u32,
    pub __reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct iommu_hwpt_get_dirty_bitmap {
    pub size: u32,
    pub hwpt_id: u32,
    pub flags: u32,
    pub __reserved: u32,
    pub iova: u64,
    pub length: u64,
    pub page_size: u64,
    pub data: u64,
}

/// /dev/iommu 文件描述符
#[derive(Debug)]
pub struct Iommufd {
    file: File,
}

impl Iommufd {
    pub fn open() -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(IOMMUFD_PATH)?;
        Ok(Self { file })
    }

    /// 分配一个 IOAS，返回句柄
    pub fn ioas_alloc(&self) -> Result<u32> {
        let mut alloc = iommu_ioas_alloc {
            size: std::mem::size_of::<iommu_ioas_alloc>() as u32,
            ..Default::default()
        };
        ioctl_mut(&self.file, IOMMU_IOAS_ALLOC(), &mut alloc, "IOMMU_IOAS_ALLOC")?;
        Ok(alloc.out_ioas_id)
    }

    /// 销毁任意 iommufd 对象（IOAS/HWPT）
    pub fn destroy(&self, id: u32) -> Result<()> {
        let destroy = iommu_destroy {
            size: std::mem::size_of::<iommu_destroy>() as u32,
            id,
        };
        ioctl_ref(&self.file, IOMMU_DESTROY(), &destroy, "IOMMU_DESTROY")?;
        Ok(())
    }

    /// 查询 IOAS 的可用 IOVA 范围（闭区间）与对齐要求
    pub fn iova_ranges(&self, ioas_id: u32) -> Result<(Vec<(u64, u64)>, u64)> {
        let mut query = iommu_ioas_iova_ranges {
            size: std::mem::size_of::<iommu_ioas_iova_ranges>() as u32,
            ioas_id,
            ..Default::default()
        };
        // 首次调用 num_iovas 为 0，内核以 EMSGSIZE 报告所需个数
        let ret = unsafe {
            vmm_sys_util::ioctl::ioctl_with_mut_ref(&self.file, IOMMU_IOAS_IOVA_RANGES(), &mut query)
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::EMSGSIZE) {
                return Err(crate::SysError::Ioctl {
                    op: "IOMMU_IOAS_IOVA_RANGES",
                    source: errno,
                });
            }
        }

        let mut ranges = vec![iommu_iova_range::default(); query.num_iovas as usize];
        query.allowed_iovas = ranges.as_mut_ptr() as u64;
        query.size = std::mem::size_of::<iommu_ioas_iova_ranges>() as u32;
        ioctl_mut(
            &self.file,
            IOMMU_IOAS_IOVA_RANGES(),
            &mut query,
            "IOMMU_IOAS_IOVA_RANGES",
        )?;
        let list = ranges
            .iter()
            .take(query.num_iovas as usize)
            .map(|r| (r.start, r.last))
            .collect();
        Ok((list, query.out_iova_alignment))
    }

    /// 在固定 IOVA 处建立映射
    pub fn map(
        &self,
        ioas_id: u32,
        iova: u64,
        length: u64,
        user_va: u64,
        readonly: bool,
    ) -> Result<()> {
        let mut flags = IOMMU_IOAS_MAP_FIXED_IOVA | IOMMU_IOAS_MAP_READABLE;
        if !readonly {
            flags |= IOMMU_IOAS_MAP_WRITEABLE;
        }
        let map = iommu_ioas_map {
            size: std::mem::size_of::<iommu_ioas_map>() as u32,
            flags,
            ioas_id,
            __reserved: 0,
            user_va,
            length,
            iova,
        };
        ioctl_ref(&self.file, IOMMU_IOAS_MAP(), &map, "IOMMU_IOAS_MAP")?;
        Ok(())
    }

    /// 解除映射，返回内核实际解除的字节数
    pub fn unmap(&self, ioas_id: u32, iova: u64, length: u64) -> Result<u64> {
        let mut unmap = iommu_ioas_unmap {
            size: std::mem::size_of::<iommu_ioas_unmap>() as u32,
            ioas_id,
            iova,
            length,
        };
        ioctl_mut(&self.file, IOMMU_IOAS_UNMAP(), &mut unmap, "IOMMU_IOAS_UNMAP")?;
        Ok(unmap.length)
    }

    /// 为设备分配硬件页表并可选启用脏页跟踪能力
    pub fn hwpt_alloc(&self, dev_id: u32, pt_id: u32, dirty_tracking: bool) -> Result<u32> {
        let mut alloc = iommu_hwpt_alloc {
            size: std::mem::size_of::<iommu_hwpt_alloc>() as u32,
            flags: if dirty_tracking {
                IOMMU_HWPT_ALLOC_DIRTY_TRACKING
            } else {
                0
            },
            dev_id,
            pt_id,
            ..Default::default()
        };
        ioctl_mut(&self.file, IOMMU_HWPT_ALLOC(), &mut alloc, "IOMMU_HWPT_ALLOC")?;
        Ok(alloc.out_hwpt_id)
    }

    /// 打开/关闭 HWPT 的脏页跟踪
    pub fn set_dirty_tracking(&self, hwpt_id: u32, enable: bool) -> Result<()> {
        let set = iommu_hwpt_set_dirty_tracking {
            size: std::mem::size_of::<iommu_hwpt_set_dirty_tracking>() as u32,
            flags: if enable { IOMMU_HWPT_DIRTY_TRACKING_ENABLE } else { 0 },
            hwpt_id,
            __reserved: 0,
        };
        ioctl_ref(
            &self.file,
            IOMMU_HWPT_SET_DIRTY_TRACKING(),
            &set,
            "IOMMU_HWPT_SET_DIRTY_TRACKING",
        )?;
        Ok(())
    }

    /// 取回 HWPT 的脏页位图
    pub fn get_dirty_bitmap(
        &self,
        hwpt_id: u32,
        iova: u64,
        length: u64,
        page_size: u64,
        bitmap: &mut [u64],
    ) -> Result<()> {
        let get = iommu_hwpt_get_dirty_bitmap {
            size: std::mem::size_of::<iommu_hwpt_get_dirty_bitmap>() as u32,
            hwpt_id,
            flags: 0,
            __reserved: 0,
            iova,
            length,
            page_size,
            data: bitmap.as_mut_ptr() as u64,
        };
        ioctl_ref(
            &self.file,
            IOMMU_HWPT_GET_DIRTY_BITMAP(),
            &get,
            "IOMMU_HWPT_GET_DIRTY_BITMAP",
        )?;
        Ok(())
    }
}

impl AsRawFd for Iommufd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iommufd_struct_sizes() {
        // linux/iommufd.h 的 sizeof，映射结构错位会让内核拒绝 size 字段
        assert_eq!(std::mem::size_of::<iommu_ioas_alloc>(), 12);
        assert_eq!(std::mem::size_of::<iommu_ioas_map>(), 40);
        assert_eq!(std::mem::size_of::<iommu_ioas_unmap>(), 24);
        assert_eq!(std::mem::size_of::<iommu_hwpt_alloc>(), 24);
        assert_eq!(std::mem::size_of::<iommu_hwpt_get_dirty_bitmap>(), 48);
    }

    #[test]
    fn test_iommufd_cmd_numbers() {
        // 命令基值 0x80，类型与 VFIO 相同 (';')
        assert_ne!(IOMMU_IOAS_MAP(), IOMMU_IOAS_UNMAP());
        assert_ne!(IOMMU_IOAS_MAP(), crate::VFIO_IOMMU_MAP_DMA());
    }
}
