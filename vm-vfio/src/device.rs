//! 设备挂接/脱离管理
//!
//! 把一个设备身份绑定到组与容器上：解析内核组号、重复挂接
//! 检查、组内 RAM-discard 策略一致性校验、设备能力查询，以及
//! 脱离时向 `disconnect_container` 的级联。

use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::backend::OpenedDevice;
use crate::error::{Result, VfioError};
use crate::registry::Registry;
use crate::{AddressSpaceId, ContainerId};

/// 一个已绑定的设备记录
#[derive(Debug)]
pub struct Device {
    pub name: String,
    pub group: u32,
    pub container: ContainerId,
    pub address_space: AddressSpaceId,
    pub inner: OpenedDevice,
    pub ram_discard_allowed: bool,
    /// 协调热复位后待清除的标记
    pub needs_reset: bool,
    /// 热复位编排期间中断已静默
    pub quiesced: bool,
    /// 各中断索引上已装配的触发 eventfd，复位恢复阶段按此重装
    pub irq_triggers: HashMap<u32, Vec<RawFd>>,
}

/// 设备能力查询项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    IommuType,
    NumRegions,
    NumIrqs,
    ResetWorks,
    DirtyPrecise,
}

/// 能力查询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityValue {
    Text(&'static str),
    Number(u32),
    Flag(bool),
}

#[derive(Default)]
pub struct DeviceManager {
    /// 设备身份 -> 记录
    pub devices: HashMap<String, Device>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 挂接一个设备到地址空间
    ///
    /// 重复身份是错误而非幂等；RAM-discard 策略由组内首个设备
    /// 定调，后来者不一致即拒绝。任何一步失败都把刚登记的组/
    /// 容器按逆序退掉，既有挂接不受影响。
    pub fn attach(
        &mut self,
        registry: &mut Registry,
        name: &str,
        space: AddressSpaceId,
        ram_discard_allowed: bool,
    ) -> Result<&Device> {
        if self.devices.contains_key(name) {
            return Err(VfioError::DuplicateDevice {
                device: name.to_string(),
            });
        }
        let group_id = registry.resolve_group_id(name)?;
        let group_was_known = registry.groups.contains_key(&group_id);
        let (container, _created) = registry.get_or_create_group(group_id, space)?;

        let result = self.attach_in_group(registry, name, group_id, container, space, ram_discard_allowed);
        if result.is_err() && !group_was_known {
            // 本次新登记的组还没有别的设备，整体退掉
            if let Err(err) = registry.disconnect_container(group_id) {
                log::warn!("unwinding group {group_id} after failed attach: {err}");
            }
        }
        result?;
        Ok(&self.devices[name])
    }

    fn attach_in_group(
        &mut self,
        registry: &mut Registry,
        name: &str,
        group_id: u32,
        container: ContainerId,
        space: AddressSpaceId,
        ram_discard_allowed: bool,
    ) -> Result<()> {
        {
            let group = registry.group_mut(group_id)?;
            match group.ram_discard_allowed {
                None => group.ram_discard_allowed = Some(ram_discard_allowed),
                Some(policy) if policy != ram_discard_allowed && !group.devices.is_empty() => {
                    return Err(VfioError::RamDiscardIncompatible {
                        device: name.to_string(),
                    });
                }
                Some(_) => group.ram_discard_allowed = Some(ram_discard_allowed),
            }
            if group.devices.iter().any(|d| d == name) {
                return Err(VfioError::DuplicateDevice {
                    device: name.to_string(),
                });
            }
        }

        let opened = registry.open_device(group_id, name)?;
        let dirty_precise = opened.dirty_precise;
        registry.group_mut(group_id)?.devices.push(name.to_string());
        self.devices.insert(
            name.to_string(),
            Device {
                name: name.to_string(),
                group: group_id,
                container,
                address_space: space,
                inner: opened,
                ram_discard_allowed,
                needs_reset: false,
                quiesced: false,
                irq_triggers: HashMap::new(),
            },
        );
        self.refresh_dirty_precision(registry, container, dirty_precise)?;
        log::info!("device {name} attached (group {group_id}, container {container:?})");
        Ok(())
    }

    /// 脱离设备；组变空时级联拆容器，返回被拆容器号
    pub fn detach(&mut self, registry: &mut Registry, name: &str) -> Result<Option<ContainerId>> {
        let device = self
            .devices
            .remove(name)
            .ok_or_else(|| VfioError::StateCorruption(format!("device {name} not attached")))?;
        registry.close_device(device.group, &device.inner);
        let remaining = {
            let group = registry.group_mut(device.group)?;
            group.devices.retain(|d| d != name);
            group.devices.len()
        };

        let torn_down = if remaining == 0 {
            registry.disconnect_container(device.group)?
        } else {
            None
        };
        if torn_down.is_none() {
            self.refresh_dirty_precision(registry, device.container, true)?;
        }
        log::info!("device {name} detached (group {})", device.group);
        Ok(torn_down)
    }

    /// 重算容器的「全员精确脏页跟踪」聚合标记
    fn refresh_dirty_precision(
        &self,
        registry: &mut Registry,
        container: ContainerId,
        newcomer_precise: bool,
    ) -> Result<()> {
        let all_precise = newcomer_precise
            && self
                .devices
                .values()
                .filter(|d| d.container == container)
                .all(|d| d.inner.dirty_precise);
        registry.container_mut(container)?.all_devices_dirty_precise = all_precise;
        Ok(())
    }

    pub fn device(&self, name: &str) -> Result<&Device> {
        self.devices
            .get(name)
            .ok_or_else(|| VfioError::StateCorruption(format!("device {name} not attached")))
    }

    pub fn device_mut(&mut self, name: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| VfioError::StateCorruption(format!("device {name} not attached")))
    }

    /// 把设备型别仿真层交来的触发 fd 装到内核并登记
    ///
    /// 登记的 fd 在热复位的恢复阶段原样重装，设备因此不会停留
    /// 在复位编排静默后的无中断状态。
    pub fn set_irq_trigger(&mut self, name: &str, index: u32, fds: Vec<RawFd>) -> Result<()> {
        let device = self.device_mut(name)?;
        if let Some(fd) = &device.inner.fd {
            fd.enable_irq_index(index, &fds)
                .map_err(|source| VfioError::kernel(name.to_string(), source))?;
        }
        device.irq_triggers.insert(index, fds);
        Ok(())
    }

    /// 摘除某中断索引上的触发 fd 并删除登记
    pub fn clear_irq_trigger(&mut self, name: &str, index: u32) -> Result<()> {
        let device = self.device_mut(name)?;
        if device.irq_triggers.remove(&index).is_some() {
            if let Some(fd) = &device.inner.fd {
                fd.disable_irq_index(index)
                    .map_err(|source| VfioError::kernel(name.to_string(), source))?;
            }
        }
        Ok(())
    }

    /// 按能力项查询设备/容器能力
    pub fn get_capability(
        &self,
        registry: &Registry,
        name: &str,
        cap: Capability,
    ) -> Result<CapabilityValue> {
        let device = self.device(name)?;
        Ok(match cap {
            Capability::IommuType => {
                CapabilityValue::Text(registry.container(device.container)?.backend.iommu_type())
            }
            Capability::NumRegions => CapabilityValue::Number(device.inner.num_regions),
            Capability::NumIrqs => CapabilityValue::Number(device.inner.num_irqs),
            Capability::ResetWorks => CapabilityValue::Flag(device.inner.reset_works),
            Capability::DirtyPrecise => CapabilityValue::Flag(device.inner.dirty_precise),
        })
    }
}
