//! 基于组的内核接口（type1 容器 + VFIO 组）
//!
//! 封装容器 fd（/dev/vfio/vfio）与组 fd（/dev/vfio/<id>）上的全部
//! ioctl：IOMMU 类型探测、DMA 映射/解除映射（含脏页位图变体）、
//! 脏页跟踪开关、sPAPR 窗口创建/删除。

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use vfio_bindings::bindings::vfio::{
    VFIO_API_VERSION, VFIO_DMA_MAP_FLAG_READ, VFIO_DMA_MAP_FLAG_WRITE, VFIO_GROUP_FLAGS_VIABLE,
    vfio_group_status, vfio_iommu_type1_dma_map, vfio_iommu_type1_dma_unmap,
};

use crate::types::{
    VFIO_DMA_UNMAP_FLAG_GET_DIRTY_BITMAP, VFIO_IOMMU_DIRTY_PAGES_FLAG_GET_BITMAP,
    VFIO_IOMMU_DIRTY_PAGES_FLAG_START, VFIO_IOMMU_DIRTY_PAGES_FLAG_STOP, VFIO_IOMMU_INFO_CAPS,
    VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE, VFIO_IOMMU_TYPE1_INFO_CAP_MIGRATION, vfio_bitmap,
    vfio_cap_header, vfio_iommu_spapr_tce_create, vfio_iommu_spapr_tce_remove,
    vfio_iommu_type1_dirty_bitmap, vfio_iommu_type1_dirty_bitmap_full,
    vfio_iommu_type1_dma_unmap_bitmap, vfio_iommu_type1_info_cap_iova_range_header,
    vfio_iommu_type1_info_cap_migration, vfio_iommu_type1_info_ext, vfio_iova_range,
};
use crate::{Result, SysError, check_ret, ioctl_mut, ioctl_none, ioctl_ref, ioctl_val};

const VFIO_CONTAINER_PATH: &str = "/dev/vfio/vfio";

/// 容器迁移能力（GET_INFO 能力链中的 migration cap）
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationCap {
    pub pgsize_bitmap: u64,
    pub max_dirty_bitmap_size: u64,
}

/// VFIO_IOMMU_GET_INFO 的解析结果
#[derive(Debug, Clone, Default)]
pub struct IommuInfo {
    /// 内核支持的 IOMMU 页大小位掩码
    pub iova_pgsizes: u64,
    /// 可用 IOVA 范围（闭区间），空表示内核未报告
    pub iova_ranges: Vec<(u64, u64)>,
    /// 脏页跟踪能力，None 表示内核不支持
    pub migration: Option<MigrationCap>,
}

/// 容器文件描述符（一个 IOMMU 翻译上下文）
#[derive(Debug)]
pub struct ContainerFd {
    file: File,
}

impl ContainerFd {
    /// 打开 /dev/vfio/vfio 并校验 API 版本
    pub fn open() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(VFIO_CONTAINER_PATH)?;
        let container = Self { file };
        let version = ioctl_none(
            &container.file,
            crate::VFIO_GET_API_VERSION(),
            "VFIO_GET_API_VERSION",
        )?;
        if version != VFIO_API_VERSION as i32 {
            return Err(SysError::ApiVersion(version));
        }
        Ok(container)
    }

    /// 查询内核是否支持某个 IOMMU 类型
    pub fn check_extension(&self, iommu_type: u32) -> Result<bool> {
        let ret = ioctl_val(
            &self.file,
            crate::VFIO_CHECK_EXTENSION(),
            iommu_type as libc::c_ulong,
            "VFIO_CHECK_EXTENSION",
        )?;
        Ok(ret > 0)
    }

    /// 启用指定的 IOMMU 类型（必须已有组加入）
    pub fn set_iommu(&self, iommu_type: u32) -> Result<()> {
        ioctl_val(
            &self.file,
            crate::VFIO_SET_IOMMU(),
            iommu_type as libc::c_ulong,
            "VFIO_SET_IOMMU",
        )?;
        Ok(())
    }

    /// 查询 IOMMU 信息，按 argsz 协议重试并解析能力链
    pub fn iommu_info(&self) -> Result<IommuInfo> {
        let mut info = vfio_iommu_type1_info_ext {
            argsz: std::mem::size_of::<vfio_iommu_type1_info_ext>() as u32,
            ..Default::default()
        };
        ioctl_mut(
            &self.file,
            crate::VFIO_IOMMU_GET_INFO(),
            &mut info,
            "VFIO_IOMMU_GET_INFO",
        )?;

        let mut result = IommuInfo {
            iova_pgsizes: info.iova_pgsizes,
            ..Default::default()
        };

        // 内核报告了更大的结构体：按 argsz 重新分配缓冲区取回能力链
        if info.flags & VFIO_IOMMU_INFO_CAPS != 0
            && info.argsz as usize > std::mem::size_of::<vfio_iommu_type1_info_ext>()
        {
            let argsz = info.argsz as usize;
            let mut buf = vec![0u8; argsz];
            let header = buf.as_mut_ptr() as *mut vfio_iommu_type1_info_ext;
            // SAFETY: buf 至少 argsz 字节，头部按 repr(C) 布局写入
            unsafe {
                (*header).argsz = argsz as u32;
            }
            let ret = unsafe {
                vmm_sys_util::ioctl::ioctl_with_mut_ptr(&self.file, crate::VFIO_IOMMU_GET_INFO(), header)
            };
            check_ret(ret, "VFIO_IOMMU_GET_INFO")?;
            // SAFETY: 内核按 argsz 填充，读取不越界
            let (pgsizes, cap_offset) = unsafe { ((*header).iova_pgsizes, (*header).cap_offset) };
            result.iova_pgsizes = pgsizes;
            parse_info_caps(&buf, cap_offset, &mut result);
        }
        Ok(result)
    }

    /// 建立一条 DMA 映射
    pub fn map_dma(&self, iova: u64, size: u64, vaddr: u64, readonly: bool) -> Result<()> {
        let mut flags = VFIO_DMA_MAP_FLAG_READ;
        if !readonly {
            flags |= VFIO_DMA_MAP_FLAG_WRITE;
        }
        let map = vfio_iommu_type1_dma_map {
            argsz: std::mem::size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags,
            vaddr,
            iova,
            size,
        };
        ioctl_ref(&self.file, crate::VFIO_IOMMU_MAP_DMA(), &map, "VFIO_IOMMU_MAP_DMA")?;
        Ok(())
    }

    /// 解除一条 DMA 映射，返回内核实际解除的字节数
    pub fn unmap_dma(&self, iova: u64, size: u64) -> Result<u64> {
        let mut unmap = vfio_iommu_type1_dma_unmap {
            argsz: std::mem::size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            flags: 0,
            iova,
            size,
            data: Default::default(),
        };
        ioctl_mut(
            &self.file,
            crate::VFIO_IOMMU_UNMAP_DMA(),
            &mut unmap,
            "VFIO_IOMMU_UNMAP_DMA",
        )?;
        Ok(unmap.size)
    }

    /// 解除映射并同时取回该范围的最终脏页位图
    pub fn unmap_dma_bitmap(
        &self,
        iova: u64,
        size: u64,
        pgsize: u64,
        bitmap: &mut [u64],
    ) -> Result<u64> {
        let mut unmap = vfio_iommu_type1_dma_unmap_bitmap {
            argsz: std::mem::size_of::<vfio_iommu_type1_dma_unmap_bitmap>() as u32,
            flags: VFIO_DMA_UNMAP_FLAG_GET_DIRTY_BITMAP,
            iova,
            size,
            bitmap: vfio_bitmap {
                pgsize,
                size: std::mem::size_of_val(bitmap) as u64,
                data: bitmap.as_mut_ptr() as u64,
            },
        };
        ioctl_mut(
            &self.file,
            crate::VFIO_IOMMU_UNMAP_DMA(),
            &mut unmap,
            "VFIO_IOMMU_UNMAP_DMA",
        )?;
        Ok(unmap.size)
    }

    /// 开启或关闭容器级脏页跟踪
    pub fn set_dirty_tracking(&self, start: bool) -> Result<()> {
        let dirty = vfio_iommu_type1_dirty_bitmap {
            argsz: std::mem::size_of::<vfio_iommu_type1_dirty_bitmap>() as u32,
            flags: if start {
                VFIO_IOMMU_DIRTY_PAGES_FLAG_START
            } else {
                VFIO_IOMMU_DIRTY_PAGES_FLAG_STOP
            },
        };
        ioctl_ref(
            &self.file,
            crate::VFIO_IOMMU_DIRTY_PAGES(),
            &dirty,
            "VFIO_IOMMU_DIRTY_PAGES",
        )?;
        Ok(())
    }

    /// 取回一段 IOVA 范围的脏页位图
    pub fn get_dirty_bitmap(
        &self,
        iova: u64,
        size: u64,
        pgsize: u64,
        bitmap: &mut [u64],
    ) -> Result<()> {
        let request = vfio_iommu_type1_dirty_bitmap_full {
            header: vfio_iommu_type1_dirty_bitmap {
                argsz: std::mem::size_of::<vfio_iommu_type1_dirty_bitmap_full>() as u32,
                flags: VFIO_IOMMU_DIRTY_PAGES_FLAG_GET_BITMAP,
            },
            get: crate::types::vfio_iommu_type1_dirty_bitmap_get {
                iova,
                size,
                bitmap: vfio_bitmap {
                    pgsize,
                    size: std::mem::size_of_val(bitmap) as u64,
                    data: bitmap.as_mut_ptr() as u64,
                },
            },
        };
        ioctl_ref(
            &self.file,
            crate::VFIO_IOMMU_DIRTY_PAGES(),
            &request,
            "VFIO_IOMMU_DIRTY_PAGES",
        )?;
        Ok(())
    }

    /// 协商一个 sPAPR DMA 窗口，成功返回内核选定的起始地址
    pub fn create_window(
        &self,
        window_size: u64,
        page_shift: u32,
        levels: u32,
    ) -> Result<u64> {
        let mut create = vfio_iommu_spapr_tce_create {
            argsz: std::mem::size_of::<vfio_iommu_spapr_tce_create>() as u32,
            page_shift,
            window_size,
            levels,
            ..Default::default()
        };
        ioctl_mut(
            &self.file,
            crate::VFIO_IOMMU_SPAPR_TCE_CREATE(),
            &mut create,
            "VFIO_IOMMU_SPAPR_TCE_CREATE",
        )?;
        Ok(create.start_addr)
    }

    /// 删除先前协商的窗口
    pub fn remove_window(&self, start_addr: u64) -> Result<()> {
        let remove = vfio_iommu_spapr_tce_remove {
            argsz: std::mem::size_of::<vfio_iommu_spapr_tce_remove>() as u32,
            flags: 0,
            start_addr,
        };
        ioctl_ref(
            &self.file,
            crate::VFIO_IOMMU_SPAPR_TCE_REMOVE(),
            &remove,
            "VFIO_IOMMU_SPAPR_TCE_REMOVE",
        )?;
        Ok(())
    }
}

impl AsRawFd for ContainerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// 组文件描述符（一个硬件隔离单元）
#[derive(Debug)]
pub struct GroupFd {
    file: File,
    id: u32,
}

impl GroupFd {
    /// 打开 /dev/vfio/<id> 并确认组可用（所有成员设备已绑定 vfio 驱动）
    pub fn open(id: u32) -> Result<Self> {
        let path = format!("/dev/vfio/{id}");
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let group = Self { file, id };

        let mut status = vfio_group_status {
            argsz: std::mem::size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        ioctl_mut(
            &group.file,
            crate::VFIO_GROUP_GET_STATUS(),
            &mut status,
            "VFIO_GROUP_GET_STATUS",
        )?;
        if status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            log::error!("group {id} is not viable: some member device is not bound to vfio");
            return Err(SysError::NotSupported("viable VFIO group"));
        }
        Ok(group)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// 尝试把组加入容器；EBUSY 等失败原样返回供调用方另建容器
    pub fn set_container(&self, container: &ContainerFd) -> Result<()> {
        let fd = container.as_raw_fd();
        ioctl_ref(
            &self.file,
            crate::VFIO_GROUP_SET_CONTAINER(),
            &fd,
            "VFIO_GROUP_SET_CONTAINER",
        )?;
        Ok(())
    }

    /// 把组从容器脱离
    pub fn unset_container(&self) -> Result<()> {
        ioctl_none(
            &self.file,
            crate::VFIO_GROUP_UNSET_CONTAINER(),
            "VFIO_GROUP_UNSET_CONTAINER",
        )?;
        Ok(())
    }

    /// 按设备名（如 "0000:01:00.0"）取得设备 fd
    pub fn get_device_fd(&self, name: &str) -> Result<File> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| SysError::InvalidSysfs(name.to_string()))?;
        // SAFETY: c_name 以 NUL 结尾，内核只读取该字符串
        let ret = unsafe {
            vmm_sys_util::ioctl::ioctl_with_ptr(
                &self.file,
                crate::VFIO_GROUP_GET_DEVICE_FD(),
                c_name.as_ptr(),
            )
        };
        let fd = check_ret(ret, "VFIO_GROUP_GET_DEVICE_FD")?;
        // SAFETY: 内核刚返回的 fd 归我们独占
        Ok(unsafe { File::from_raw_fd(fd) })
    }
}

impl AsRawFd for GroupFd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// 遍历 GET_INFO 返回缓冲区中的能力链
fn parse_info_caps(buf: &[u8], mut offset: u32, out: &mut IommuInfo) {
    while offset != 0 && (offset as usize) + std::mem::size_of::<vfio_cap_header>() <= buf.len() {
        // SAFETY: 上面的边界检查保证 header 完整落在 buf 内
        let header = unsafe {
            std::ptr::read_unaligned(buf.as_ptr().add(offset as usize) as *const vfio_cap_header)
        };
        match header.id {
            VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE => {
                parse_iova_range_cap(buf, offset as usize, out);
            }
            VFIO_IOMMU_TYPE1_INFO_CAP_MIGRATION => {
                let end = offset as usize + std::mem::size_of::<vfio_iommu_type1_info_cap_migration>();
                if end <= buf.len() {
                    // SAFETY: 边界已检查
                    let cap = unsafe {
                        std::ptr::read_unaligned(
                            buf.as_ptr().add(offset as usize)
                                as *const vfio_iommu_type1_info_cap_migration,
                        )
                    };
                    out.migration = Some(MigrationCap {
                        pgsize_bitmap: cap.pgsize_bitmap,
                        max_dirty_bitmap_size: cap.max_dirty_bitmap_size,
                    });
                }
            }
            other => {
                log::debug!("ignoring unknown IOMMU info capability {other}");
            }
        }
        if header.next <= offset {
            // 防御链表成环
            break;
        }
        offset = header.next;
    }
}

fn parse_iova_range_cap(buf: &[u8], offset: usize, out: &mut IommuInfo) {
    let head_size = std::mem::size_of::<vfio_iommu_type1_info_cap_iova_range_header>();
    if offset + head_size > buf.len() {
        return;
    }
    // SAFETY: 边界已检查
    let head = unsafe {
        std::ptr::read_unaligned(
            buf.as_ptr().add(offset) as *const vfio_iommu_type1_info_cap_iova_range_header,
        )
    };
    let mut pos = offset + head_size;
    for _ in 0..head.nr_iovas {
        if pos + std::mem::size_of::<vfio_iova_range>() > buf.len() {
            break;
        }
        // SAFETY: 边界已检查
        let range =
            unsafe { std::ptr::read_unaligned(buf.as_ptr().add(pos) as *const vfio_iova_range) };
        out.iova_ranges.push((range.start, range.end));
        pos += std::mem::size_of::<vfio_iova_range>();
    }
}
