//! 容器与窗口记录
//!
//! Container 对应一个内核 IOMMU 翻译上下文：后端实例、页大小
//! 掩码、成员组、已协商的 DMA 窗口、RAM-discard 监听与客体 IOMMU
//! 通知器登记，以及脏页跟踪状态。容器恰好属于一个地址空间，
//! 组列表变空的那一刻被销毁。

use std::collections::BTreeMap;

use crate::backend::{DirtyCaps, IommuBackend};
use crate::dirty::HostDirtyBitmap;
use crate::{AddressSpaceId, ContainerId};

/// 显式协商的 IOVA 窗口（闭区间）及其可用页大小集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDmaWindow {
    pub min_iova: u64,
    pub max_iova: u64,
    pub page_sizes: u64,
}

impl HostDmaWindow {
    pub fn overlaps(&self, other: &HostDmaWindow) -> bool {
        self.min_iova <= other.max_iova && other.min_iova <= self.max_iova
    }

    pub fn covers(&self, start: u64, end: u64) -> bool {
        self.min_iova <= start && end <= self.max_iova
    }
}

/// 一条已登记的 DMA 映射
#[derive(Debug, Clone, Copy)]
pub struct MappingRecord {
    pub size: u64,
    pub vaddr: u64,
    pub readonly: bool,
}

/// RAM-discard 区域的监听登记（填充/丢弃通知按粒度映射）
#[derive(Debug, Clone, Copy)]
pub struct RamDiscardListener {
    pub region_iova: u64,
    pub size: u64,
    pub granularity: u64,
    pub host_addr: u64,
}

/// 客体 IOMMU 区域的翻译通知器登记
#[derive(Debug, Clone, Copy)]
pub struct IommuNotifierRecord {
    pub iova: u64,
    pub size: u64,
}

/// 容器脏页跟踪状态
#[derive(Debug, Clone, Copy, Default)]
pub struct DirtyTrackingState {
    pub caps: DirtyCaps,
    pub started: bool,
}

pub struct Container {
    pub id: ContainerId,
    pub address_space: AddressSpaceId,
    pub backend: Box<dyn IommuBackend>,
    /// 内核支持的 IOMMU 页大小位掩码
    pub page_size_mask: u64,
    /// 可用 IOVA 范围（闭区间），空表示不受限
    pub iova_ranges: Vec<(u64, u64)>,
    pub requires_windows: bool,
    pub windows: Vec<HostDmaWindow>,
    /// 成员组（内核组号）
    pub groups: Vec<u32>,
    /// 按 IOVA 排序的活跃映射
    pub mappings: BTreeMap<u64, MappingRecord>,
    pub ram_discard_listeners: Vec<RamDiscardListener>,
    pub iommu_notifiers: Vec<IommuNotifierRecord>,
    pub dirty: DirtyTrackingState,
    /// unmap 时取回的残留脏页，下一次查询时并入
    pub dirty_residual: Vec<HostDirtyBitmap>,
    /// 所有成员设备都支持精确脏页跟踪
    pub all_devices_dirty_precise: bool,
    /// 首个初始化错误（粘滞：一旦置位容器视为中毒直到拆除）
    pub setup_error: Option<String>,
}

impl Container {
    /// 是否已有窗口完整覆盖 [start, end]
    pub fn window_covering(&self, start: u64, end: u64) -> Option<&HostDmaWindow> {
        self.windows.iter().find(|w| w.covers(start, end))
    }

    /// 新窗口是否与既有窗口重叠（重叠是宿主状态损坏）
    pub fn window_would_overlap(&self, candidate: &HostDmaWindow) -> bool {
        self.windows.iter().any(|w| w.overlaps(candidate))
    }

    /// IOVA 区间是否落在内核报告的可用范围内
    pub fn iova_allowed(&self, start: u64, end: u64) -> bool {
        if self.iova_ranges.is_empty() {
            return true;
        }
        self.iova_ranges
            .iter()
            .any(|&(lo, hi)| lo <= start && end <= hi)
    }

    /// 地址空间顶端边界（内核 unmap 越界缺陷的回退用）
    pub fn max_iova(&self) -> Option<u64> {
        self.iova_ranges.iter().map(|&(_, hi)| hi).max()
    }

    /// 最小 IOMMU 页大小
    pub fn min_page_size(&self) -> u64 {
        if self.page_size_mask == 0 {
            0x1000
        } else {
            1u64 << self.page_size_mask.trailing_zeros()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_overlap_detection() {
        let full = HostDmaWindow { min_iova: 0, max_iova: 0xFFFF_FFFF, page_sizes: 0x1000 };
        let high = HostDmaWindow {
            min_iova: 0x8000_0000,
            max_iova: 0xFFFF_FFFF,
            page_sizes: 0x1000,
        };
        let above = HostDmaWindow {
            min_iova: 0x1_0000_0000,
            max_iova: 0x1_FFFF_FFFF,
            page_sizes: 0x1000,
        };
        assert!(full.overlaps(&high));
        assert!(high.overlaps(&full));
        assert!(!full.overlaps(&above));
    }

    #[test]
    fn test_window_covers() {
        let window = HostDmaWindow { min_iova: 0x1000, max_iova: 0xFFFF, page_sizes: 0x1000 };
        assert!(window.covers(0x1000, 0xFFFF));
        assert!(window.covers(0x2000, 0x2FFF));
        assert!(!window.covers(0, 0xFFF));
        assert!(!window.covers(0x8000, 0x1_0000));
    }

    #[test]
    fn test_min_page_size_from_mask() {
        let mask = 0x1000u64 | 0x20_0000;
        assert_eq!(1u64 << mask.trailing_zeros(), 0x1000);
    }
}
