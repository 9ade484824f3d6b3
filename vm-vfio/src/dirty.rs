//! 脏页跟踪引擎
//!
//! 启停硬件脏页记录、取回区间位图，并把内核粒度的位图折算进
//! 宿主侧的脏页表示。内核位图粒度由内核规定（与客体页大小可能
//! 不同）；折算一律以宿主页大小为单位。

use crate::container::Container;
use crate::error::{Result, VfioError};

/// 宿主侧脏页位图：以宿主页为单位的一段 IOVA 区间
#[derive(Debug, Clone)]
pub struct HostDirtyBitmap {
    base_iova: u64,
    size: u64,
    page_size: u64,
    bits: Vec<u64>,
}

impl HostDirtyBitmap {
    pub fn new(base_iova: u64, size: u64, page_size: u64) -> Self {
        let pages = size.div_ceil(page_size) as usize;
        Self {
            base_iova,
            size,
            page_size,
            bits: vec![0; pages.div_ceil(64)],
        }
    }

    pub fn base_iova(&self) -> u64 {
        self.base_iova
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// 标记一段区间为脏（区间以 IOVA 表示）
    pub fn mark(&mut self, iova: u64, len: u64) {
        if len == 0 || iova + len <= self.base_iova || iova >= self.base_iova + self.size {
            return;
        }
        let start = iova.max(self.base_iova) - self.base_iova;
        let end = (iova + len).min(self.base_iova + self.size) - self.base_iova;
        let first = (start / self.page_size) as usize;
        let last = end.div_ceil(self.page_size) as usize;
        for page in first..last {
            self.bits[page / 64] |= 1u64 << (page % 64);
        }
    }

    pub fn mark_all(&mut self) {
        self.mark(self.base_iova, self.size);
    }

    pub fn is_dirty(&self, iova: u64) -> bool {
        if iova < self.base_iova || iova >= self.base_iova + self.size {
            return false;
        }
        let page = ((iova - self.base_iova) / self.page_size) as usize;
        self.bits[page / 64] & (1u64 << (page % 64)) != 0
    }

    pub fn dirty_pages(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// 把内核粒度的位图折算进来：内核第 n 位置位时，其覆盖的
    /// 全部宿主页置脏
    pub fn fold_kernel_bitmap(&mut self, kernel_bits: &[u64], kernel_page_size: u64, iova: u64) {
        for (word_idx, &word) in kernel_bits.iter().enumerate() {
            if word == 0 {
                continue;
            }
            for bit in 0..64 {
                if word & (1u64 << bit) != 0 {
                    let page_iova = iova + (word_idx as u64 * 64 + bit) * kernel_page_size;
                    self.mark(page_iova, kernel_page_size);
                }
            }
        }
    }

    /// 吸收另一张位图（unmap 残留位图并入查询结果）
    pub fn merge(&mut self, other: &HostDirtyBitmap) {
        for (word_idx, &word) in other.bits.iter().enumerate() {
            if word == 0 {
                continue;
            }
            for bit in 0..64 {
                if word & (1u64 << bit) != 0 {
                    let page_iova = other.base_iova + (word_idx as u64 * 64 + bit) * other.page_size;
                    self.mark(page_iova, other.page_size);
                }
            }
        }
    }
}

/// 内核位图缓冲区大小（u64 字数）
pub(crate) fn kernel_bitmap_words(size: u64, kernel_page_size: u64) -> usize {
    (size.div_ceil(kernel_page_size) as usize).div_ceil(64)
}

/// 启停容器的脏页跟踪
///
/// 失败时错误里带上尝试的方向（start/stop），内核版本不匹配
/// 靠它定位。只有容器处于挂接状态才可调用。
pub fn set_tracking(container: &mut Container, start: bool) -> Result<()> {
    if !container.dirty.caps.supported {
        return Err(VfioError::NotSupported("dirty page tracking"));
    }
    container.backend.set_dirty_tracking(start)?;
    container.dirty.started = start;
    if !start {
        container.dirty_residual.clear();
    }
    log::debug!("container {:?} dirty tracking -> {start}", container.id);
    Ok(())
}

/// 查询一段 IOVA 区间的脏页位图，折算为宿主页粒度
///
/// 跟踪未启动时的查询属于宿主状态损坏：拒绝且不发出任何内核
/// 调用。聚合粒度混杂（某成员设备不支持精确跟踪）时整段保守
/// 置脏。
pub fn query_bitmap(
    container: &mut Container,
    iova: u64,
    size: u64,
    host_page_size: u64,
) -> Result<HostDirtyBitmap> {
    if !container.dirty.started {
        return Err(VfioError::StateCorruption(format!(
            "dirty bitmap query on container {:?} while tracking is stopped",
            container.id
        )));
    }

    let mut host = HostDirtyBitmap::new(iova, size, host_page_size);

    if !container.all_devices_dirty_precise {
        // 安全回退：任何不确定性都按全脏处理
        log::warn!(
            "container {:?} has imprecise dirty tracking, marking whole range dirty",
            container.id
        );
        host.mark_all();
    } else {
        // 位图按内核规定的页粒度分配，而不是客体的页粒度
        let kernel_page_size = if container.dirty.caps.page_size != 0 {
            container.dirty.caps.page_size
        } else {
            host_page_size
        };
        let mut kernel_bits = vec![0u64; kernel_bitmap_words(size, kernel_page_size)];
        container
            .backend
            .query_dirty_bitmap(iova, size, kernel_page_size, &mut kernel_bits)?;
        host.fold_kernel_bitmap(&kernel_bits, kernel_page_size, iova);
    }

    // 并入 unmap 时抢下来的残留脏页；整段落在本次查询范围内的
    // 随查询一次性消费，防止同一页被每次查询重复上报
    let end = iova.saturating_add(size);
    container.dirty_residual.retain(|residual| {
        host.merge(residual);
        let consumed =
            residual.base_iova >= iova && residual.base_iova.saturating_add(residual.size) <= end;
        !consumed
    });
    Ok(host)
}
