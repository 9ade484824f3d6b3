//! KVM 协同提示
//!
//! 通过 KVM 的 VFIO 伪设备把在用的组 fd 通告给加速器，内核据此
//! 做一致性优化（如非一致 DMA 时的缓存属性处理）。纯性能提示：
//! 注册失败只记日志，从不影响挂接流程。

use std::os::fd::RawFd;

use kvm_bindings::{kvm_create_device, kvm_device_attr, kvm_device_type_KVM_DEV_TYPE_VFIO};
use kvm_ioctls::VmFd;

use crate::error::{Result, VfioError};

const KVM_DEV_VFIO_GROUP: u32 = 1;
const KVM_DEV_VFIO_GROUP_ADD: u64 = 1;
const KVM_DEV_VFIO_GROUP_DEL: u64 = 2;

pub struct KvmVfioBridge {
    device: kvm_ioctls::DeviceFd,
}

impl KvmVfioBridge {
    /// 在 VM 上创建 KVM 的 VFIO 伪设备
    pub fn new(vm: &VmFd) -> Result<Self> {
        let mut create = kvm_create_device {
            type_: kvm_device_type_KVM_DEV_TYPE_VFIO,
            fd: 0,
            flags: 0,
        };
        let device = match vm.create_device(&mut create) {
            Ok(device) => device,
            Err(err) => {
                log::warn!("KVM VFIO pseudo device unavailable: {err}");
                return Err(VfioError::NotSupported("KVM VFIO pseudo device"));
            }
        };
        Ok(Self { device })
    }

    fn set_group_attr(&self, attr: u64, group_fd: RawFd) -> std::result::Result<(), kvm_ioctls::Error> {
        let fd = group_fd;
        let device_attr = kvm_device_attr {
            group: KVM_DEV_VFIO_GROUP,
            attr,
            addr: &fd as *const RawFd as u64,
            flags: 0,
        };
        self.device.set_device_attr(&device_attr)
    }

    /// 通告一个新挂入的组 fd
    pub fn add_group(&self, group_fd: RawFd) {
        if let Err(err) = self.set_group_attr(KVM_DEV_VFIO_GROUP_ADD, group_fd) {
            log::warn!("registering group fd {group_fd} with KVM failed: {err}");
        }
    }

    /// 撤销一个脱离的组 fd
    pub fn del_group(&self, group_fd: RawFd) {
        if let Err(err) = self.set_group_attr(KVM_DEV_VFIO_GROUP_DEL, group_fd) {
            log::warn!("deregistering group fd {group_fd} from KVM failed: {err}");
        }
    }
}
