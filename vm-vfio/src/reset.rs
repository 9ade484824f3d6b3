//! 热复位编排
//!
//! 总线复位会波及与目标共享复位域的全部设备，而复位域的成员
//! 只有内核知道。流程：先静默目标中断，再向内核查询依赖集，
//! 校验所有依赖组都归本进程所有，最后发一次协调复位。任何
//! 校验失败都把已静默的设备恢复原状，绝不把设备留在无中断
//! 状态。依赖集每次重算，不持久化。

use std::collections::BTreeSet;
use std::os::fd::{AsRawFd, RawFd};

use vm_vfio_sys::device::DependentDevice;

use crate::backend::BackendKind;
use crate::device::{Device, DeviceManager};
use crate::error::{Result, VfioError};
use crate::registry::Registry;

/// 静默设备中断并打静默标记
///
/// 触发 fd 本身由设备型别仿真层经 `set_irq_trigger` 登记，
/// 这里摘除链路后靠该登记在恢复阶段原样重装。
fn quiesce(device: &mut Device) -> Result<()> {
    if let Some(fd) = &device.inner.fd {
        fd.disable_irq_index(vfio_bindings::bindings::vfio::VFIO_PCI_INTX_IRQ_INDEX)
            .map_err(|source| VfioError::kernel(device.name.clone(), source))?;
    }
    device.quiesced = true;
    Ok(())
}

/// 把静默过的设备恢复到编排前的中断状态
///
/// 静默时摘掉的是整条触发链路，恢复必须把挂接时登记的触发 fd
/// 重装回内核；没有 fd 或没有登记过触发的设备无事可做。重装失
/// 败只告警，恢复路径不把清理动作升级成硬错误。
fn restore(device: &mut Device) {
    if device.quiesced {
        if let (Some(fd), Some(triggers)) = (
            &device.inner.fd,
            device
                .irq_triggers
                .get(&vfio_bindings::bindings::vfio::VFIO_PCI_INTX_IRQ_INDEX),
        ) {
            if let Err(err) = fd.enable_irq_index(
                vfio_bindings::bindings::vfio::VFIO_PCI_INTX_IRQ_INDEX,
                triggers,
            ) {
                log::warn!("rearming interrupts on {} failed: {err}", device.name);
            }
        }
    }
    device.quiesced = false;
}

/// 恢复一批已静默的设备
fn restore_all(devices: &mut DeviceManager, names: &[String]) {
    for name in names {
        if let Ok(device) = devices.device_mut(name) {
            restore(device);
        }
    }
}

/// 对目标设备执行协调热复位
///
/// `single` 表示调用方只接受独占复位：复位域里出现任何其他
/// 已挂接设备即放弃。依赖组未被本进程持有时返回「无法协调」，
/// 此时所有已静默设备均已恢复。
pub fn hot_reset(
    registry: &mut Registry,
    devices: &mut DeviceManager,
    target: &str,
    single: bool,
    discover: impl FnOnce(&Device) -> Result<Vec<DependentDevice>>,
) -> Result<()> {
    // 目标先静默，之后才能安全探测复位域
    quiesce(devices.device_mut(target)?)?;
    let mut quiesced = vec![target.to_string()];

    let deps = match discover(devices.device(target)?) {
        Ok(deps) => deps,
        Err(err) => {
            restore_all(devices, &quiesced);
            return Err(err);
        }
    };
    let dep_groups: BTreeSet<u32> = deps.iter().map(|d| d.group_id).collect();
    let target_group = devices.device(target)?.group;

    // 所有依赖组都必须已在注册表里（即归本进程所有）
    for dep in &deps {
        if !registry.groups.contains_key(&dep.group_id) {
            restore_all(devices, &quiesced);
            return Err(VfioError::CannotCoordinate {
                device: target.to_string(),
                group: dep.group_id,
            });
        }
    }

    // 受波及的其他已挂接设备
    let affected: Vec<String> = devices
        .devices
        .values()
        .filter(|d| d.name != target && dep_groups.contains(&d.group))
        .map(|d| d.name.clone())
        .collect();
    if single && (!affected.is_empty() || dep_groups.iter().any(|&g| g != target_group)) {
        restore_all(devices, &quiesced);
        return Err(VfioError::CannotCoordinate {
            device: target.to_string(),
            group: target_group,
        });
    }
    for name in &affected {
        if let Err(err) = quiesce(devices.device_mut(name)?) {
            restore_all(devices, &quiesced);
            return Err(err);
        }
        quiesced.push(name.clone());
    }

    let result = execute(registry, devices, target, &dep_groups, &affected);
    if result.is_ok() {
        // 一次协调复位覆盖整个复位域，其余成员不必再单独复位
        for name in quiesced.iter() {
            if let Ok(device) = devices.device_mut(name) {
                device.needs_reset = false;
            }
        }
        log::info!(
            "hot reset of {target} done ({} dependent groups, {} co-resident devices)",
            dep_groups.len(),
            affected.len()
        );
    }
    restore_all(devices, &quiesced);
    result
}

/// 收集代际相应的参与者 fd 并发出复位调用
///
/// legacy 后端要的是参与组的 fd，iommufd 后端要的是参与设备
/// 的 fd。
fn execute(
    registry: &mut Registry,
    devices: &DeviceManager,
    target: &str,
    dep_groups: &BTreeSet<u32>,
    affected: &[String],
) -> Result<()> {
    let device = devices.device(target)?;
    let container = device.container;
    let kind = registry.container(container)?.backend.kind();

    let fds: Vec<RawFd> = match kind {
        BackendKind::Legacy => dep_groups
            .iter()
            .filter_map(|g| registry.groups.get(g))
            .filter_map(|g| g.handle.raw_fd())
            .collect(),
        BackendKind::Iommufd => std::iter::once(target)
            .chain(affected.iter().map(String::as_str))
            .filter_map(|name| devices.devices.get(name))
            .filter_map(|d| d.inner.fd.as_ref())
            .map(|fd| fd.as_raw_fd())
            .collect(),
    };

    let target_fd = device.inner.fd.as_ref();
    registry
        .container_mut(container)?
        .backend
        .pci_hot_reset(target_fd, &fds)
}

/// 复位所有带 needs_reset 标记的设备
///
/// 一次协调复位会顺带清掉同域成员的标记，循环里据此去重。
pub fn reset_all_needed(
    registry: &mut Registry,
    devices: &mut DeviceManager,
    discover: impl Fn(&Device) -> Result<Vec<DependentDevice>>,
) -> Result<()> {
    let names: Vec<String> = devices
        .devices
        .values()
        .filter(|d| d.needs_reset)
        .map(|d| d.name.clone())
        .collect();
    for name in names {
        if !devices.device(&name)?.needs_reset {
            continue;
        }
        hot_reset(registry, devices, &name, false, &discover)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{new_shared, MockFactory, MockOp, SharedMock};
    use crate::AddressSpaceId;
    use std::collections::HashMap;

    fn setup() -> (Registry, DeviceManager, SharedMock) {
        let state = new_shared();
        let mut groups = HashMap::new();
        groups.insert("0000:01:00.0".to_string(), 11);
        groups.insert("0000:01:00.1".to_string(), 11);
        groups.insert("0000:02:00.0".to_string(), 22);
        let factory = MockFactory {
            state: state.clone(),
            groups,
        };
        (Registry::new(Box::new(factory)), DeviceManager::new(), state)
    }

    fn attach(registry: &mut Registry, devices: &mut DeviceManager, name: &str) {
        devices
            .attach(registry, name, AddressSpaceId(0), true)
            .unwrap();
    }

    fn dep(group_id: u32, bus: u8, devfn: u8) -> DependentDevice {
        DependentDevice {
            group_id,
            segment: 0,
            bus,
            devfn,
        }
    }

    #[test]
    fn test_hot_reset_coordinates_owned_groups() {
        let (mut registry, mut devices, state) = setup();
        attach(&mut registry, &mut devices, "0000:01:00.0");
        attach(&mut registry, &mut devices, "0000:01:00.1");
        devices.device_mut("0000:01:00.1").unwrap().needs_reset = true;

        hot_reset(&mut registry, &mut devices, "0000:01:00.0", false, |_| {
            Ok(vec![dep(11, 1, 0), dep(11, 1, 1)])
        })
        .unwrap();

        assert!(state
            .borrow()
            .ops
            .iter()
            .any(|op| matches!(op, MockOp::HotReset { .. })));
        // 同域成员的待复位标记被顺带清掉，没人留在静默态
        assert!(!devices.device("0000:01:00.1").unwrap().needs_reset);
        assert!(!devices.device("0000:01:00.0").unwrap().quiesced);
        assert!(!devices.device("0000:01:00.1").unwrap().quiesced);
    }

    #[test]
    fn test_unowned_dependent_group_restores_quiesced() {
        let (mut registry, mut devices, state) = setup();
        attach(&mut registry, &mut devices, "0000:01:00.0");

        let err = hot_reset(&mut registry, &mut devices, "0000:01:00.0", false, |_| {
            Ok(vec![dep(11, 1, 0), dep(99, 3, 0)])
        })
        .unwrap_err();

        assert!(matches!(
            err,
            VfioError::CannotCoordinate { group: 99, .. }
        ));
        assert!(!devices.device("0000:01:00.0").unwrap().quiesced);
        // 复位调用从未发出
        assert!(!state
            .borrow()
            .ops
            .iter()
            .any(|op| matches!(op, MockOp::HotReset { .. })));
    }

    #[test]
    fn test_failed_reset_preserves_trigger_records() {
        let (mut registry, mut devices, _state) = setup();
        attach(&mut registry, &mut devices, "0000:01:00.0");
        devices
            .set_irq_trigger(
                "0000:01:00.0",
                vfio_bindings::bindings::vfio::VFIO_PCI_INTX_IRQ_INDEX,
                vec![7],
            )
            .unwrap();

        hot_reset(&mut registry, &mut devices, "0000:01:00.0", false, |_| {
            Ok(vec![dep(11, 1, 0), dep(99, 3, 0)])
        })
        .unwrap_err();

        // 恢复阶段重装靠的就是这份登记，失败路径绝不能弄丢
        let device = devices.device("0000:01:00.0").unwrap();
        assert!(!device.quiesced);
        assert_eq!(
            device.irq_triggers[&vfio_bindings::bindings::vfio::VFIO_PCI_INTX_IRQ_INDEX],
            vec![7]
        );
    }

    #[test]
    fn test_single_mode_rejects_shared_domain() {
        let (mut registry, mut devices, _state) = setup();
        attach(&mut registry, &mut devices, "0000:01:00.0");
        attach(&mut registry, &mut devices, "0000:01:00.1");

        let err = hot_reset(&mut registry, &mut devices, "0000:01:00.0", true, |_| {
            Ok(vec![dep(11, 1, 0), dep(11, 1, 1)])
        })
        .unwrap_err();
        assert!(matches!(err, VfioError::CannotCoordinate { .. }));
        assert!(!devices.device("0000:01:00.1").unwrap().quiesced);
    }

    #[test]
    fn test_reset_all_needed_dedups_shared_domain() {
        let (mut registry, mut devices, state) = setup();
        attach(&mut registry, &mut devices, "0000:01:00.0");
        attach(&mut registry, &mut devices, "0000:01:00.1");
        devices.device_mut("0000:01:00.0").unwrap().needs_reset = true;
        devices.device_mut("0000:01:00.1").unwrap().needs_reset = true;

        reset_all_needed(&mut registry, &mut devices, |_| {
            Ok(vec![dep(11, 1, 0), dep(11, 1, 1)])
        })
        .unwrap();

        let resets = state
            .borrow()
            .ops
            .iter()
            .filter(|op| matches!(op, MockOp::HotReset { .. }))
            .count();
        assert_eq!(resets, 1);
    }
}
