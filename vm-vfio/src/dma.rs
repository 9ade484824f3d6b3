//! DMA 映射引擎
//!
//! 把客体内存拓扑变化（区域加入/移除通知）换算成容器上的
//! map/unmap 内核调用：宿主页对齐检查、IOVA 范围过滤、sPAPR
//! 类后端的显式窗口簿记、EBUSY 换映射重试、冗余 unmap 归一，
//! 以及内核 unmap 顶端边界缺陷的窄范围回退。

use crate::container::{Container, HostDmaWindow, IommuNotifierRecord, MappingRecord, RamDiscardListener};
use crate::dirty::{kernel_bitmap_words, HostDirtyBitmap};
use crate::error::{Result, VfioError};

/// 区域的宿主后备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionBacking {
    /// 普通 RAM：静态映射
    Ram,
    /// 可丢弃 RAM：按填充/丢弃通知的粒度映射
    RamDiscard { granularity: u64 },
    /// 客体 IOMMU 区域：按翻译通知逐笔映射
    GuestIommu,
}

/// 一段连续的客体内存区域通知
#[derive(Debug, Clone, Copy)]
pub struct MemorySection {
    /// 区域在地址空间内的偏移（即目标 IOVA）
    pub iova: u64,
    pub size: u64,
    /// 宿主虚拟地址
    pub host_addr: u64,
    pub readonly: bool,
    pub backing: SectionBacking,
}

/// 区域对齐到页粒度；起始上取整、结束下取整
///
/// IOVA 偏移与宿主地址的页内偏移不一致时无法对齐映射，按宿主
/// 配置错误拒绝，绝不静默截断。取整后长度归零的小区域直接忽略。
fn align_section(section: &MemorySection, page_size: u64) -> Result<Option<(u64, u64, u64)>> {
    let mask = page_size - 1;
    if section.iova & mask != section.host_addr & mask {
        return Err(VfioError::HostMisaligned {
            iova: section.iova,
            size: section.size,
        });
    }
    let iova = (section.iova + mask) & !mask;
    let end = (section.iova + section.size) & !mask;
    if end <= iova {
        // 取整后不足一页的残段合法但无法映射，只告警一次
        static SUBPAGE_SKIP: std::sync::Once = std::sync::Once::new();
        SUBPAGE_SKIP.call_once(|| {
            log::warn!(
                "section {:#x}+{:#x} rounds to nothing at page size {page_size:#x}, skipping",
                section.iova,
                section.size
            );
        });
        return Ok(None);
    }
    let vaddr = section.host_addr + (iova - section.iova);
    Ok(Some((iova, end - iova, vaddr)))
}

/// 单笔映射：登记簿记，EBUSY 时先解除同一范围再重试一次
///
/// 重试序列对调用方原子：中间状态不可见，重试仍失败按原错误
/// 上报。
pub fn map_one(
    container: &mut Container,
    iova: u64,
    size: u64,
    vaddr: u64,
    readonly: bool,
) -> Result<()> {
    if let Err(err) = container.backend.dma_map(iova, size, vaddr, readonly) {
        if err.errno() != Some(libc::EBUSY) {
            return Err(err);
        }
        // 同一 IOVA 先前已有映射且内核拒绝原子替换：解除后重试
        log::debug!("map of {iova:#x}+{size:#x} busy, replacing existing mapping");
        container.backend.dma_unmap(iova, size)?;
        container.backend.dma_map(iova, size, vaddr, readonly)?;
    }
    container
        .mappings
        .insert(iova, MappingRecord { size, vaddr, readonly });
    Ok(())
}

/// 单笔解除：冗余 unmap 归一为成功，顶端边界缺陷窄范围回退
///
/// 簿记里查不到该范围时不发内核调用（客体 IOMMU 回放会产生
/// 合法的重复 unmap）。跟踪开启时走带位图的 unmap，最终脏页存
/// 入容器残留位图供下一次查询合并。
pub fn unmap_one(container: &mut Container, iova: u64, size: u64) -> Result<u64> {
    if container.mappings.get(&iova).is_none_or(|rec| rec.size != size) {
        // 不精确命中也允许：范围落在某条既有映射内才发调用
        let covered = container
            .mappings
            .range(..=iova)
            .next_back()
            .is_some_and(|(&base, rec)| iova >= base && iova + size <= base + rec.size);
        if !covered {
            return Ok(0);
        }
    }

    let unmapped = if container.dirty.started && container.dirty.caps.supported {
        let page_size = container.dirty.caps.page_size.max(container.min_page_size());
        let mut bits = vec![0u64; kernel_bitmap_words(size, page_size)];
        let unmapped = container.backend.dma_unmap_bitmap(iova, size, page_size, &mut bits)?;
        let mut residual = HostDirtyBitmap::new(iova, size, page_size);
        residual.fold_kernel_bitmap(&bits, page_size, iova);
        if residual.dirty_pages() > 0 {
            container.dirty_residual.push(residual);
        }
        unmapped
    } else {
        match container.backend.dma_unmap(iova, size) {
            Ok(n) => n,
            Err(err) if err.errno() == Some(libc::ENOENT) => {
                // 范围本就未映射：回放产生的重复 unmap，按成功处理
                0
            }
            Err(err)
                if err.errno() == Some(libc::EINVAL)
                    && size >= container.min_page_size()
                    && iova.wrapping_add(size) == 0 =>
            {
                // 内核拒绝解除恰好终止于地址空间顶端的范围，
                // 去掉最顶上一个 IOMMU 页后重试
                let trimmed = size - container.min_page_size();
                if trimmed == 0 {
                    0
                } else {
                    container.backend.dma_unmap(iova, trimmed)?
                }
            }
            Err(err) => return Err(err),
        }
    };
    remove_mapped_range(container, iova, size);
    Ok(unmapped)
}

/// 从簿记中扣掉一段已解除的范围
///
/// 范围落在一条更大的既有映射内部时把记录拆成两端剩余，簿记
/// 始终如实反映内核侧仍然存在的映射。
fn remove_mapped_range(container: &mut Container, iova: u64, size: u64) {
    let Some((&base, &rec)) = container.mappings.range(..=iova).next_back() else {
        return;
    };
    let end = base.wrapping_add(rec.size);
    if iova.wrapping_add(size) > end {
        return;
    }
    container.mappings.remove(&base);
    if iova > base {
        container.mappings.insert(
            base,
            MappingRecord {
                size: iova - base,
                vaddr: rec.vaddr,
                readonly: rec.readonly,
            },
        );
    }
    if iova.wrapping_add(size) < end {
        container.mappings.insert(
            iova.wrapping_add(size),
            MappingRecord {
                size: end - iova.wrapping_add(size),
                vaddr: rec.vaddr + (iova.wrapping_add(size) - base),
                readonly: rec.readonly,
            },
        );
    }
}

/// 为区域保证窗口覆盖（仅显式窗口后端）
///
/// 重叠的候选窗口在发出任何内核调用之前拒绝：窗口重叠说明宿主
/// 状态已损坏。页大小取内核掩码里不超过区域对齐的最大者。
fn ensure_window(container: &mut Container, iova: u64, size: u64) -> Result<()> {
    let end = iova + size - 1;
    if container.window_covering(iova, end).is_some() {
        return Ok(());
    }
    let page_size = window_page_size(container.page_size_mask, iova | size);
    let candidate = HostDmaWindow {
        min_iova: iova,
        max_iova: end,
        page_sizes: page_size,
    };
    if container.window_would_overlap(&candidate) {
        return Err(VfioError::StateCorruption(format!(
            "new DMA window {iova:#x}..{end:#x} overlaps an existing window"
        )));
    }
    let start = container
        .backend
        .add_window(size, page_size.trailing_zeros())?;
    if start != iova {
        // 内核给了别的起始地址，收回并报错
        if let Err(err) = container.backend.del_window(start) {
            log::warn!("removing misplaced window at {start:#x} failed: {err}");
        }
        return Err(VfioError::StateCorruption(format!(
            "kernel placed DMA window at {start:#x}, expected {iova:#x}"
        )));
    }
    container.windows.push(candidate);
    log::debug!("DMA window {iova:#x}..{end:#x} created (page size {page_size:#x})");
    Ok(())
}

/// 窗口可用的最大页大小：内核掩码中不超过区域对齐的最大位
fn window_page_size(mask: u64, alignment: u64) -> u64 {
    let mut best = 0x1000;
    let mut bits = mask;
    while bits != 0 {
        let page = 1u64 << (63 - bits.leading_zeros());
        if alignment & (page - 1) == 0 {
            best = page;
            break;
        }
        bits &= !page;
    }
    best
}

/// 区域加入：按后备类型登记或映射
pub fn region_added(
    container: &mut Container,
    section: &MemorySection,
    host_page_size: u64,
) -> Result<()> {
    let page_size = host_page_size.max(container.min_page_size());
    let Some((iova, size, vaddr)) = align_section(section, page_size)? else {
        return Ok(());
    };
    let end = iova + size - 1;
    if !container.iova_allowed(iova, end) {
        log::debug!("section {iova:#x}+{size:#x} outside usable IOVA ranges, skipped");
        return Ok(());
    }

    match section.backing {
        SectionBacking::GuestIommu => {
            // 客体 IOMMU 区域不做静态映射，登记翻译通知器
            container.iommu_notifiers.push(IommuNotifierRecord { iova, size });
            log::debug!("guest IOMMU notifier registered for {iova:#x}+{size:#x}");
            Ok(())
        }
        SectionBacking::RamDiscard { granularity } => {
            if container.requires_windows {
                ensure_window(container, iova, size)?;
            }
            container.ram_discard_listeners.push(RamDiscardListener {
                region_iova: iova,
                size,
                granularity,
                host_addr: vaddr,
            });
            log::debug!("RAM-discard listener registered for {iova:#x}+{size:#x}");
            Ok(())
        }
        SectionBacking::Ram => {
            if container.requires_windows {
                ensure_window(container, iova, size)?;
            }
            let result = map_one(container, iova, size, vaddr, section.readonly);
            if let Err(err) = &result {
                // 区域通知无处上报错误，粘滞记录首个失败
                if container.setup_error.is_none() {
                    container.setup_error = Some(err.to_string());
                }
                log::error!("mapping section {iova:#x}+{size:#x} failed: {err}");
            }
            result
        }
    }
}

/// 区域移除：解除映射或撤销登记，窗口随之回收
pub fn region_removed(
    container: &mut Container,
    section: &MemorySection,
    host_page_size: u64,
) -> Result<()> {
    let page_size = host_page_size.max(container.min_page_size());
    let Some((iova, size, _vaddr)) = align_section(section, page_size)? else {
        return Ok(());
    };

    match section.backing {
        SectionBacking::GuestIommu => {
            container
                .iommu_notifiers
                .retain(|n| !(n.iova == iova && n.size == size));
            return Ok(());
        }
        SectionBacking::RamDiscard { .. } => {
            container
                .ram_discard_listeners
                .retain(|l| !(l.region_iova == iova && l.size == size));
            // 已填充的块仍在映射簿记里，逐块解除
            let stale: Vec<(u64, u64)> = container
                .mappings
                .range(iova..iova + size)
                .map(|(&i, rec)| (i, rec.size))
                .collect();
            for (chunk_iova, chunk_size) in stale {
                unmap_one(container, chunk_iova, chunk_size)?;
            }
        }
        SectionBacking::Ram => {
            unmap_one(container, iova, size)?;
        }
    }

    if container.requires_windows {
        reclaim_window(container, iova, iova + size - 1)?;
    }
    Ok(())
}

/// 回收不再承载任何映射的窗口
fn reclaim_window(container: &mut Container, start: u64, end: u64) -> Result<()> {
    let Some(pos) = container.windows.iter().position(|w| w.covers(start, end)) else {
        return Ok(());
    };
    let window = container.windows[pos];
    let in_use = container
        .mappings
        .range(window.min_iova..=window.max_iova)
        .next()
        .is_some();
    if in_use {
        return Ok(());
    }
    container.backend.del_window(window.min_iova)?;
    container.windows.remove(pos);
    log::debug!(
        "DMA window {:#x}..{:#x} removed",
        window.min_iova,
        window.max_iova
    );
    Ok(())
}

/// RAM-discard 填充通知：按登记粒度映射一段刚填充的块
pub fn notify_populate(container: &mut Container, iova: u64, size: u64) -> Result<()> {
    let listener = container
        .ram_discard_listeners
        .iter()
        .find(|l| l.region_iova <= iova && iova + size <= l.region_iova + l.size)
        .copied()
        .ok_or_else(|| {
            VfioError::StateCorruption(format!(
                "populate notification {iova:#x}+{size:#x} outside any registered region"
            ))
        })?;
    let mut offset = 0;
    while offset < size {
        let chunk = listener.granularity.min(size - offset);
        let vaddr = listener.host_addr + (iova - listener.region_iova) + offset;
        map_one(container, iova + offset, chunk, vaddr, false)?;
        offset += chunk;
    }
    Ok(())
}

/// RAM-discard 丢弃通知：解除刚被丢弃的块
pub fn notify_discard(container: &mut Container, iova: u64, size: u64) -> Result<()> {
    let chunks: Vec<(u64, u64)> = container
        .mappings
        .range(iova..iova + size)
        .map(|(&i, rec)| (i, rec.size))
        .collect();
    for (chunk_iova, chunk_size) in chunks {
        unmap_one(container, chunk_iova, chunk_size)?;
    }
    Ok(())
}

/// 客体 IOMMU 翻译通知：一笔虚拟 DMA 事务的映射或解除
///
/// `translated` 为 Some 时按翻译结果映射单条范围，None 表示
/// 该翻译已失效需要解除。
pub fn iommu_notify(
    container: &mut Container,
    iova: u64,
    size: u64,
    translated: Option<(u64, bool)>,
) -> Result<()> {
    let registered = container
        .iommu_notifiers
        .iter()
        .any(|n| n.iova <= iova && iova + size <= n.iova + n.size);
    if !registered {
        log::debug!("IOMMU notification {iova:#x}+{size:#x} outside registered ranges, ignored");
        return Ok(());
    }
    match translated {
        Some((vaddr, readonly)) => map_one(container, iova, size, vaddr, readonly),
        None => unmap_one(container, iova, size).map(|_| ()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::mock::{new_shared, MockBackend, MockOp, SharedMock};
    use crate::container::DirtyTrackingState;
    use crate::backend::DirtyCaps;
    use crate::{AddressSpaceId, ContainerId};

    pub(crate) fn mock_container(state: SharedMock) -> Container {
        Container {
            id: ContainerId(0),
            address_space: AddressSpaceId(0),
            backend: Box::new(MockBackend { state }),
            page_size_mask: 0x1000,
            iova_ranges: Vec::new(),
            requires_windows: false,
            windows: Vec::new(),
            groups: vec![1],
            mappings: std::collections::BTreeMap::new(),
            ram_discard_listeners: Vec::new(),
            iommu_notifiers: Vec::new(),
            dirty: DirtyTrackingState {
                caps: DirtyCaps {
                    supported: true,
                    page_size: 0x1000,
                    max_bitmap_size: 256 << 20,
                },
                started: false,
            },
            dirty_residual: Vec::new(),
            all_devices_dirty_precise: true,
            setup_error: None,
        }
    }

    fn ram_section(iova: u64, size: u64, host_addr: u64) -> MemorySection {
        MemorySection {
            iova,
            size,
            host_addr,
            readonly: false,
            backing: SectionBacking::Ram,
        }
    }

    #[test]
    fn test_map_then_unmap_single_ioctl_each() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        region_added(&mut container, &ram_section(0x1000, 0x1000, 0x7f00_0000), 0x1000).unwrap();
        region_removed(&mut container, &ram_section(0x1000, 0x1000, 0x7f00_0000), 0x1000).unwrap();
        let ops = state.borrow().ops.clone();
        assert_eq!(
            ops,
            vec![
                MockOp::Map { iova: 0x1000, size: 0x1000, readonly: false },
                MockOp::Unmap { iova: 0x1000, size: 0x1000 },
            ]
        );
    }

    #[test]
    fn test_busy_map_retries_after_unmap() {
        let state = new_shared();
        state.borrow_mut().map_errors.push_back(Some(libc::EBUSY));
        let mut container = mock_container(state.clone());
        map_one(&mut container, 0x2000, 0x1000, 0x7f00_0000, false).unwrap();
        let ops = state.borrow().ops.clone();
        assert_eq!(
            ops,
            vec![
                MockOp::Map { iova: 0x2000, size: 0x1000, readonly: false },
                MockOp::Unmap { iova: 0x2000, size: 0x1000 },
                MockOp::Map { iova: 0x2000, size: 0x1000, readonly: false },
            ]
        );
    }

    #[test]
    fn test_enoent_unmap_is_success() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        map_one(&mut container, 0x1000, 0x1000, 0x7f00_0000, false).unwrap();
        state.borrow_mut().unmap_errors.push_back(Some(libc::ENOENT));
        assert_eq!(unmap_one(&mut container, 0x1000, 0x1000).unwrap(), 0);
    }

    #[test]
    fn test_second_unmap_issues_no_ioctl() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        map_one(&mut container, 0x1000, 0x1000, 0x7f00_0000, false).unwrap();
        unmap_one(&mut container, 0x1000, 0x1000).unwrap();
        let before = state.borrow().ops.len();
        assert_eq!(unmap_one(&mut container, 0x1000, 0x1000).unwrap(), 0);
        assert_eq!(state.borrow().ops.len(), before);
    }

    #[test]
    fn test_partial_unmap_splits_bookkeeping() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        map_one(&mut container, 0x1000, 0x4000, 0x7f00_0000, false).unwrap();

        // 解除大映射中段：簿记拆成两端剩余
        assert_eq!(unmap_one(&mut container, 0x2000, 0x1000).unwrap(), 0x1000);
        let left = container.mappings[&0x1000];
        let right = container.mappings[&0x3000];
        assert_eq!((left.size, left.vaddr), (0x1000, 0x7f00_0000));
        assert_eq!((right.size, right.vaddr), (0x2000, 0x7f00_2000));

        // 同一中段的重复解除不再命中簿记，也不再发内核调用
        let before = state.borrow().ops.len();
        assert_eq!(unmap_one(&mut container, 0x2000, 0x1000).unwrap(), 0);
        assert_eq!(state.borrow().ops.len(), before);
    }

    #[test]
    fn test_top_boundary_unmap_retries_trimmed() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        let iova = 0xFFFF_FFFF_FFFF_0000;
        map_one(&mut container, iova, 0x10000, 0x7f00_0000, false).unwrap();
        state.borrow_mut().unmap_errors.push_back(Some(libc::EINVAL));
        unmap_one(&mut container, iova, 0x10000).unwrap();
        let ops = state.borrow().ops.clone();
        assert_eq!(ops.last(), Some(&MockOp::Unmap { iova, size: 0x10000 - 0x1000 }));
    }

    #[test]
    fn test_subpage_section_skipped_without_error() {
        let section = MemorySection {
            iova: 0x1100,
            size: 0x200,
            host_addr: 0x7f00_0100,
            readonly: false,
            backing: SectionBacking::Ram,
        };
        assert!(align_section(&section, 0x1000).unwrap().is_none());
    }

    #[test]
    fn test_misaligned_section_rejected() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        // IOVA 与宿主地址页内偏移不一致
        let section = ram_section(0x1080, 0x1000, 0x7f00_0000);
        let err = region_added(&mut container, &section, 0x1000).unwrap_err();
        assert!(matches!(err, VfioError::HostMisaligned { .. }));
        assert!(state.borrow().ops.is_empty());
    }

    #[test]
    fn test_window_negotiated_before_mapping() {
        let state = new_shared();
        state.borrow_mut().next_window_start = 0;
        let mut container = mock_container(state.clone());
        container.requires_windows = true;
        region_added(&mut container, &ram_section(0, 0x1000_0000, 0x7f00_0000), 0x1000).unwrap();
        let ops = state.borrow().ops.clone();
        assert_eq!(ops[0], MockOp::AddWindow { size: 0x1000_0000, page_shift: 12 });
        assert!(matches!(ops[1], MockOp::Map { .. }));
        assert_eq!(container.windows.len(), 1);
    }

    #[test]
    fn test_overlapping_window_rejected_without_ioctl() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        container.requires_windows = true;
        container.windows.push(HostDmaWindow {
            min_iova: 0,
            max_iova: 0xFFFF_FFFF,
            page_sizes: 0x1000,
        });
        let err = ensure_window(&mut container, 0x8000_0000, 0x1_0000_0000).unwrap_err();
        assert!(matches!(err, VfioError::StateCorruption(_)));
        assert!(err.is_fatal());
        assert!(state.borrow().ops.is_empty());
    }

    #[test]
    fn test_unmap_with_dirty_tracking_keeps_residual() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        map_one(&mut container, 0x1000, 0x1000, 0x7f00_0000, false).unwrap();
        container.dirty.started = true;
        unmap_one(&mut container, 0x1000, 0x1000).unwrap();
        assert!(state
            .borrow()
            .ops
            .contains(&MockOp::UnmapBitmap { iova: 0x1000, size: 0x1000 }));
    }

    #[test]
    fn test_populate_maps_in_granularity_chunks() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        let section = MemorySection {
            iova: 0x10_0000,
            size: 0x40_0000,
            host_addr: 0x7f00_0000,
            readonly: false,
            backing: SectionBacking::RamDiscard { granularity: 0x20_0000 },
        };
        region_added(&mut container, &section, 0x1000).unwrap();
        // 登记本身不映射
        assert!(state.borrow().ops.is_empty());
        notify_populate(&mut container, 0x10_0000, 0x40_0000).unwrap();
        let maps = state
            .borrow()
            .ops
            .iter()
            .filter(|op| matches!(op, MockOp::Map { .. }))
            .count();
        assert_eq!(maps, 2);
        notify_discard(&mut container, 0x10_0000, 0x40_0000).unwrap();
        assert!(container.mappings.is_empty());
    }

    #[test]
    fn test_iommu_notify_maps_and_unmaps() {
        let state = new_shared();
        let mut container = mock_container(state.clone());
        let section = MemorySection {
            iova: 0,
            size: 0x1000_0000,
            host_addr: 0,
            readonly: false,
            backing: SectionBacking::GuestIommu,
        };
        region_added(&mut container, &section, 0x1000).unwrap();
        iommu_notify(&mut container, 0x4000, 0x1000, Some((0x7f00_4000, false))).unwrap();
        assert!(container.mappings.contains_key(&0x4000));
        iommu_notify(&mut container, 0x4000, 0x1000, None).unwrap();
        assert!(container.mappings.is_empty());
        // 再次解除同一翻译不再发内核调用
        let before = state.borrow().ops.len();
        iommu_notify(&mut container, 0x4000, 0x1000, None).unwrap();
        assert_eq!(state.borrow().ops.len(), before);
    }

    #[test]
    fn test_map_failure_poisons_container() {
        let state = new_shared();
        state.borrow_mut().map_errors.push_back(Some(libc::ENOMEM));
        let mut container = mock_container(state.clone());
        let err = region_added(&mut container, &ram_section(0, 0x1000, 0x7f00_0000), 0x1000);
        assert!(err.is_err());
        assert!(container.setup_error.is_some());
    }
}
