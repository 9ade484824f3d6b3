//! sysfs 设备发现
//!
//! 组归属通过解析 `.../iommu_group` 符号链接得到数字组号；
//! 链接缺失或不可读属于发现期错误，由挂接流程直接中止。

use std::path::{Path, PathBuf};

use crate::{Result, SysError};

const PCI_DEVICES_ROOT: &str = "/sys/bus/pci/devices";

/// 设备的 sysfs 目录（PCI 设备按 "0000:01:00.0" 形式寻址）
pub fn device_sysfs_path(name: &str) -> PathBuf {
    Path::new(PCI_DEVICES_ROOT).join(name)
}

/// 解析设备所属的 IOMMU 组号
///
/// IOMMU 未启用（链接不存在）与链接内容异常分别报错，
/// 便于上层区分环境问题和内核状态问题。
pub fn resolve_iommu_group(sysfs_path: &Path) -> Result<u32> {
    let link = sysfs_path.join("iommu_group");
    if !link.exists() {
        return Err(SysError::InvalidSysfs(format!(
            "{}: no iommu_group link (IOMMU disabled?)",
            sysfs_path.display()
        )));
    }

    let target = std::fs::read_link(&link)?;
    let group_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SysError::InvalidSysfs(format!("{}: bad iommu_group link", link.display())))?;

    group_name.parse::<u32>().map_err(|_| {
        SysError::InvalidSysfs(format!("{}: non-numeric iommu_group '{group_name}'", link.display()))
    })
}

/// cdev 模式下设备节点路径（/dev/vfio/devices/vfioN）
pub fn device_cdev_path(sysfs_path: &Path) -> Result<PathBuf> {
    let vfio_dev_dir = sysfs_path.join("vfio-dev");
    for entry in std::fs::read_dir(&vfio_dev_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("vfio") {
            return Ok(Path::new("/dev/vfio/devices").join(name));
        }
    }
    Err(SysError::InvalidSysfs(format!(
        "{}: no vfio-dev entry (cdev not available)",
        sysfs_path.display()
    )))
}
