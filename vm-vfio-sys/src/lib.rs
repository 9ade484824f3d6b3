//! VFIO / iommufd 内核 ABI 封装
//!
//! 为设备直通核心提供两代内核接口的原始 ioctl 封装：
//! - 基于组的旧接口（type1 容器 + VFIO 组文件描述符）
//! - 基于句柄的新接口（iommufd，IOAS/HWPT 对象）
//!
//! 本层不持有任何注册表状态，纯粹的请求/响应封装。所有多字段
//! ioctl 结构体以自描述的 argsz/size 字段开头，内核报告更大的
//! 结构体时调用方负责按 argsz 重试。

use std::os::fd::AsRawFd;

use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr};

pub mod device;
pub mod iommufd;
pub mod legacy;
pub mod sysfs;
pub mod types;

/// 内核接口层错误类型
#[derive(Debug, thiserror::Error)]
pub enum SysError {
    /// ioctl 失败，保留操作名与原始 errno 便于诊断内核版本差异
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kernel does not support {0}")]
    NotSupported(&'static str),
    #[error("unexpected VFIO API version {0}")]
    ApiVersion(i32),
    #[error("invalid sysfs entry: {0}")]
    InvalidSysfs(String),
}

impl SysError {
    /// 取出底层 errno（仅 ioctl/IO 错误有）
    pub fn errno(&self) -> Option<i32> {
        match self {
            SysError::Ioctl { source, .. } | SysError::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn last_ioctl(op: &'static str) -> Self {
        SysError::Ioctl {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SysError>;

// VFIO ioctl 编号（linux/vfio.h：_IO(';', 100 + n)，参数经 arg 指针传递）
const VFIO_TYPE: u32 = b';' as u32;
const VFIO_BASE: u32 = 100;

ioctl_io_nr!(VFIO_GET_API_VERSION, VFIO_TYPE, VFIO_BASE);
ioctl_io_nr!(VFIO_CHECK_EXTENSION, VFIO_TYPE, VFIO_BASE + 1);
ioctl_io_nr!(VFIO_SET_IOMMU, VFIO_TYPE, VFIO_BASE + 2);
ioctl_io_nr!(VFIO_GROUP_GET_STATUS, VFIO_TYPE, VFIO_BASE + 3);
ioctl_io_nr!(VFIO_GROUP_SET_CONTAINER, VFIO_TYPE, VFIO_BASE + 4);
ioctl_io_nr!(VFIO_GROUP_UNSET_CONTAINER, VFIO_TYPE, VFIO_BASE + 5);
ioctl_io_nr!(VFIO_GROUP_GET_DEVICE_FD, VFIO_TYPE, VFIO_BASE + 6);
ioctl_io_nr!(VFIO_DEVICE_GET_INFO, VFIO_TYPE, VFIO_BASE + 7);
ioctl_io_nr!(VFIO_DEVICE_GET_REGION_INFO, VFIO_TYPE, VFIO_BASE + 8);
ioctl_io_nr!(VFIO_DEVICE_GET_IRQ_INFO, VFIO_TYPE, VFIO_BASE + 9);
ioctl_io_nr!(VFIO_DEVICE_SET_IRQS, VFIO_TYPE, VFIO_BASE + 10);
ioctl_io_nr!(VFIO_DEVICE_RESET, VFIO_TYPE, VFIO_BASE + 11);
ioctl_io_nr!(VFIO_DEVICE_GET_PCI_HOT_RESET_INFO, VFIO_TYPE, VFIO_BASE + 12);
ioctl_io_nr!(VFIO_DEVICE_PCI_HOT_RESET, VFIO_TYPE, VFIO_BASE + 13);
ioctl_io_nr!(VFIO_DEVICE_FEATURE, VFIO_TYPE, VFIO_BASE + 17);
ioctl_io_nr!(VFIO_DEVICE_BIND_IOMMUFD, VFIO_TYPE, VFIO_BASE + 18);
ioctl_io_nr!(VFIO_DEVICE_ATTACH_IOMMUFD_PT, VFIO_TYPE, VFIO_BASE + 19);
ioctl_io_nr!(VFIO_DEVICE_DETACH_IOMMUFD_PT, VFIO_TYPE, VFIO_BASE + 20);
// 容器 fd 上的编号与设备 fd 编号空间重叠，内核按 fd 类型区分
ioctl_io_nr!(VFIO_IOMMU_GET_INFO, VFIO_TYPE, VFIO_BASE + 12);
ioctl_io_nr!(VFIO_IOMMU_MAP_DMA, VFIO_TYPE, VFIO_BASE + 13);
ioctl_io_nr!(VFIO_IOMMU_UNMAP_DMA, VFIO_TYPE, VFIO_BASE + 14);
ioctl_io_nr!(VFIO_IOMMU_DIRTY_PAGES, VFIO_TYPE, VFIO_BASE + 17);
ioctl_io_nr!(VFIO_IOMMU_SPAPR_TCE_CREATE, VFIO_TYPE, VFIO_BASE + 19);
ioctl_io_nr!(VFIO_IOMMU_SPAPR_TCE_REMOVE, VFIO_TYPE, VFIO_BASE + 20);

/// 检查 ioctl 返回值，负值转换为带操作名的错误
pub(crate) fn check_ret(ret: libc::c_int, op: &'static str) -> Result<i32> {
    if ret < 0 {
        Err(SysError::last_ioctl(op))
    } else {
        Ok(ret)
    }
}

/// 分配可容纳 `count` 个尾随 `F` 元素的 `T` 向量（flexible array member）
///
/// 与 rust-vmm 的 FAM 辅助函数一致：返回的向量首元素为清零的 `T`，
/// 其后的空间足以放下尾随数组，可安全地交给内核填充。
pub fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * std::mem::size_of::<F>();
    let vec_size_bytes = std::mem::size_of::<T>() + element_space;
    let rounded_size = vec_size_bytes.div_ceil(std::mem::size_of::<T>());
    let mut v = Vec::with_capacity(rounded_size);
    v.resize_with(rounded_size, T::default);
    v
}

/// 以不可变引用发起 ioctl
pub(crate) fn ioctl_ref<F: AsRawFd, T>(
    fd: &F,
    req: libc::c_ulong,
    arg: &T,
    op: &'static str,
) -> Result<i32> {
    // SAFETY: 调用方保证 arg 与 req 对应的内核结构体布局一致
    let ret = unsafe { vmm_sys_util::ioctl::ioctl_with_ref(fd, req, arg) };
    check_ret(ret, op)
}

/// 以可变引用发起 ioctl（内核回填结果）
pub(crate) fn ioctl_mut<F: AsRawFd, T>(
    fd: &F,
    req: libc::c_ulong,
    arg: &mut T,
    op: &'static str,
) -> Result<i32> {
    // SAFETY: 同上，内核写入不会越过 T 的边界（argsz 已设置）
    let ret = unsafe { vmm_sys_util::ioctl::ioctl_with_mut_ref(fd, req, arg) };
    check_ret(ret, op)
}

/// 无参数 ioctl
pub(crate) fn ioctl_none<F: AsRawFd>(fd: &F, req: libc::c_ulong, op: &'static str) -> Result<i32> {
    // SAFETY: 该请求不携带参数
    let ret = unsafe { vmm_sys_util::ioctl::ioctl(fd, req) };
    check_ret(ret, op)
}

/// 以 usize 直接作为参数发起 ioctl（VFIO_CHECK_EXTENSION 等）
pub(crate) fn ioctl_val<F: AsRawFd>(
    fd: &F,
    req: libc::c_ulong,
    val: libc::c_ulong,
    op: &'static str,
) -> Result<i32> {
    // SAFETY: 该请求按值解释参数，不解引用
    let ret = unsafe { vmm_sys_util::ioctl::ioctl_with_val(fd, req, val) };
    check_ret(ret, op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_distinct_per_fd_kind() {
        // 容器与设备 fd 编号空间重叠是内核 ABI 的事实，常量值必须一致
        assert_eq!(VFIO_IOMMU_GET_INFO(), VFIO_DEVICE_GET_PCI_HOT_RESET_INFO());
        assert_eq!(VFIO_IOMMU_MAP_DMA(), VFIO_DEVICE_PCI_HOT_RESET());
        assert_ne!(VFIO_IOMMU_MAP_DMA(), VFIO_IOMMU_UNMAP_DMA());
    }

    #[test]
    fn test_vec_with_array_field_capacity() {
        #[derive(Default)]
        #[repr(C)]
        struct Header {
            a: u64,
            b: u64,
        }
        let v = vec_with_array_field::<Header, u32>(5);
        assert!(v.len() * std::mem::size_of::<Header>() >= 16 + 5 * 4);
        assert_eq!(v[0].a, 0);
    }
}
