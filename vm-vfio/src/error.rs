//! 直通核心错误类型定义
//!
//! 错误分类：发现错误、内核 ABI 错误、拓扑冲突、能力缺失、
//! 宿主状态损坏。前四类作为 Result 返回给调用方；最后一类
//! 经 `is_fatal()` 区分，嵌入方在记录完整诊断信息后终止进程。

use vm_vfio_sys::SysError;

/// 直通核心错误类型
#[derive(Debug, thiserror::Error)]
pub enum VfioError {
    /// 发现期错误：无法解析设备/组身份，挂接直接中止
    #[error("device discovery failed for {device}: {source}")]
    Discovery {
        device: String,
        #[source]
        source: SysError,
    },

    /// 内核 ABI 错误：携带操作名、目标与原始 errno
    #[error("kernel call failed on {target}: {source}")]
    Kernel {
        target: String,
        #[source]
        source: SysError,
    },

    /// 同一内核组被两个地址空间认领（真实的宿主拓扑错误）
    #[error("group {group} is already used in a different address space")]
    GroupAddressSpaceConflict { group: u32 },

    /// 重复挂接同一设备身份
    #[error("device {device} is already attached")]
    DuplicateDevice { device: String },

    /// 组内 RAM-discard 兼容性不一致
    #[error("device {device} conflicts with the group's RAM discard policy")]
    RamDiscardIncompatible { device: String },

    /// 区域未按宿主页对齐（配置错误，绝不静默截断）
    #[error("region iova={iova:#x} size={size:#x} is not host-page aligned")]
    HostMisaligned { iova: u64, size: u64 },

    /// 能力缺失：调用方可据此回退，而不是当作致命错误
    #[error("{0} is not supported by the host kernel")]
    NotSupported(&'static str),

    /// 热复位无法协调：复位域中存在不归本进程所有的组
    #[error("hot reset of {device} cannot be coordinated: group {group} is not owned")]
    CannotCoordinate { device: String, group: u32 },

    /// 宿主状态损坏（重叠窗口、未启动时查询脏页位图等），
    /// 唯一允许终止进程的类别
    #[error("host state corruption: {0}")]
    StateCorruption(String),
}

impl VfioError {
    /// 包装内核层错误并附上目标标识
    pub fn kernel(target: impl Into<String>, source: SysError) -> Self {
        VfioError::Kernel {
            target: target.into(),
            source,
        }
    }

    /// 取出底层 errno（仅内核 ABI 错误有）
    pub fn errno(&self) -> Option<i32> {
        match self {
            VfioError::Kernel { source, .. } | VfioError::Discovery { source, .. } => {
                source.errno()
            }
            _ => None,
        }
    }

    /// 是否属于不可恢复的宿主状态损坏
    pub fn is_fatal(&self) -> bool {
        matches!(self, VfioError::StateCorruption(_))
    }
}

pub type Result<T> = std::result::Result<T, VfioError>;
