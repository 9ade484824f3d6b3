//! VFIO 设备直通核心
//!
//! 管理内核隔离域到客体地址空间的绑定：容器/组/设备生命周期、
//! DMA 映射同步、脏页跟踪、跨设备协调热复位，以及 type1 与
//! iommufd 两代内核 ABI 之上的统一后端抽象。设备型别仿真
//! （PCI 配置空间、BAR、中断路由）在上层，通过
//! [`PassthroughManager`] 消费这里的原语。

pub mod backend;
pub mod container;
pub mod device;
pub mod dirty;
pub mod dma;
pub mod error;
pub mod manager;
pub mod registry;
pub mod reset;

#[cfg(feature = "kvm")]
pub mod hypervisor;

pub use backend::{BackendKind, DirtyCaps, IommuBackend, SetupInfo};
pub use container::{Container, HostDmaWindow};
pub use device::{Capability, CapabilityValue, Device};
pub use dirty::HostDirtyBitmap;
pub use dma::{MemorySection, SectionBacking};
pub use error::{Result, VfioError};
pub use manager::{AddressResolver, PassthroughConfig, PassthroughManager};

/// 客体地址空间的稳定标识，由嵌入方分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(pub u64);

/// 容器的稳定标识，由注册表分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerId(pub u64);

impl std::fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "as{}", self.0)
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "container{}", self.0)
    }
}
