//! 绑定 crate 尚未覆盖的内核 ABI 结构体
//!
//! `vfio-bindings` 由较早的内核头文件生成，type1 脏页跟踪、
//! 设备 feature 以及 sPAPR 窗口协商的结构体在此按 uapi 布局补齐。
//! 所有结构体 `#[repr(C)]`，字段顺序与 linux/vfio.h 一致。

#![allow(non_camel_case_types)]

// ---- VFIO_IOMMU_GET_INFO（带 cap_offset 的 5.7+ 布局） ----

pub const VFIO_IOMMU_INFO_PGSIZES: u32 = 1 << 0;
pub const VFIO_IOMMU_INFO_CAPS: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_type1_info_ext {
    pub argsz: u32,
    pub flags: u32,
    pub iova_pgsizes: u64,
    pub cap_offset: u32,
    pub pad: u32,
}

// ---- type1 脏页跟踪 (VFIO_IOMMU_DIRTY_PAGES, kernel >= 5.7) ----

pub const VFIO_IOMMU_DIRTY_PAGES_FLAG_START: u32 = 1 << 0;
pub const VFIO_IOMMU_DIRTY_PAGES_FLAG_STOP: u32 = 1 << 1;
pub const VFIO_IOMMU_DIRTY_PAGES_FLAG_GET_BITMAP: u32 = 1 << 2;

/// 位图描述符：页粒度 + 位图字节数 + 用户态缓冲区指针
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_bitmap {
    pub pgsize: u64,
    pub size: u64,
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_type1_dirty_bitmap {
    pub argsz: u32,
    pub flags: u32,
}

/// GET_BITMAP 变体的尾随负载
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_type1_dirty_bitmap_get {
    pub iova: u64,
    pub size: u64,
    pub bitmap: vfio_bitmap,
}

/// START/STOP/GET_BITMAP 的完整请求（header + get 负载一次性声明，
/// START/STOP 时内核只读取 header 部分）
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_type1_dirty_bitmap_full {
    pub header: vfio_iommu_type1_dirty_bitmap,
    pub get: vfio_iommu_type1_dirty_bitmap_get,
}

// ---- unmap 同时取回脏页位图 ----

pub const VFIO_DMA_UNMAP_FLAG_GET_DIRTY_BITMAP: u32 = 1 << 0;

/// 带位图负载的 unmap 请求
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_type1_dma_unmap_bitmap {
    pub argsz: u32,
    pub flags: u32,
    pub iova: u64,
    pub size: u64,
    pub bitmap: vfio_bitmap,
}

// ---- VFIO_IOMMU_GET_INFO 能力链 ----

pub const VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE: u16 = 1;
pub const VFIO_IOMMU_TYPE1_INFO_CAP_MIGRATION: u16 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iova_range {
    pub start: u64,
    pub end: u64,
}

/// 能力链头（与 vfio_info_cap_header 布局一致，便于本地解析）
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_cap_header {
    pub id: u16,
    pub version: u16,
    pub next: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_type1_info_cap_iova_range_header {
    pub header: vfio_cap_header,
    pub nr_iovas: u32,
    pub reserved: u32,
    // 其后是 nr_iovas 个 vfio_iova_range
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_type1_info_cap_migration {
    pub header: vfio_cap_header,
    pub flags: u32,
    pub pgsize_bitmap: u64,
    pub max_dirty_bitmap_size: u64,
}

// ---- 设备 feature (VFIO_DEVICE_FEATURE, kernel >= 5.15) ----

pub const VFIO_DEVICE_FEATURE_MASK: u32 = 0xffff;
pub const VFIO_DEVICE_FEATURE_GET: u32 = 1 << 16;
pub const VFIO_DEVICE_FEATURE_SET: u32 = 1 << 17;
pub const VFIO_DEVICE_FEATURE_PROBE: u32 = 1 << 18;

pub const VFIO_DEVICE_FEATURE_DMA_LOGGING_START: u32 = 6;
pub const VFIO_DEVICE_FEATURE_DMA_LOGGING_STOP: u32 = 7;
pub const VFIO_DEVICE_FEATURE_DMA_LOGGING_REPORT: u32 = 8;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_device_feature {
    pub argsz: u32,
    pub flags: u32,
    // 其后是 feature 相关负载
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_device_feature_dma_logging_range {
    pub iova: u64,
    pub length: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_device_feature_dma_logging_control {
    pub page_size: u64,
    pub num_ranges: u32,
    pub __reserved: u32,
    pub ranges: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_device_feature_dma_logging_report {
    pub iova: u64,
    pub length: u64,
    pub page_size: u64,
    pub bitmap: u64,
}

// ---- sPAPR 窗口协商 ----

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_spapr_tce_create {
    pub argsz: u32,
    pub flags: u32,
    pub page_shift: u32,
    pub __resv1: u32,
    pub window_size: u64,
    pub levels: u32,
    pub __resv2: u32,
    pub start_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_iommu_spapr_tce_remove {
    pub argsz: u32,
    pub flags: u32,
    pub start_addr: u64,
}

// ---- cdev / iommufd 绑定 (kernel >= 6.6) ----

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_device_bind_iommufd {
    pub argsz: u32,
    pub flags: u32,
    pub iommufd: i32,
    pub out_devid: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_device_attach_iommufd_pt {
    pub argsz: u32,
    pub flags: u32,
    pub pt_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vfio_device_detach_iommufd_pt {
    pub argsz: u32,
    pub flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_struct_sizes() {
        // 与 linux/vfio.h 的 sizeof 对齐，布局错位会直接破坏 ioctl
        assert_eq!(std::mem::size_of::<vfio_bitmap>(), 24);
        assert_eq!(std::mem::size_of::<vfio_iommu_type1_dirty_bitmap>(), 8);
        assert_eq!(std::mem::size_of::<vfio_iommu_type1_dirty_bitmap_get>(), 40);
        assert_eq!(std::mem::size_of::<vfio_iommu_type1_dma_unmap_bitmap>(), 48);
        assert_eq!(std::mem::size_of::<vfio_iommu_spapr_tce_create>(), 40);
        assert_eq!(std::mem::size_of::<vfio_device_bind_iommufd>(), 16);
    }

    #[test]
    fn test_cap_header_layout() {
        assert_eq!(std::mem::size_of::<vfio_cap_header>(), 8);
        assert_eq!(std::mem::size_of::<vfio_iova_range>(), 16);
    }
}
