use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use filetime::FileTime;

use crate::kernel::api::nfs::*;

fn nfstime(seconds: i64, nseconds: i64) -> nfstime3 {
    nfstime3 {
        seconds: seconds.clamp(0, u32::MAX as i64) as u32,
        nseconds: nseconds.clamp(0, 999_999_999) as u32,
    }
}

// glibc dev_t layout
fn major(dev: u64) -> u32 {
    (((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff)) as u32
}

fn minor(dev: u64) -> u32 {
    (((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff)) as u32
}

pub fn ftype_of(meta: &Metadata) -> ftype3 {
    let ft = meta.file_type();
    if ft.is_dir() {
        ftype3::NF3DIR
    } else if ft.is_symlink() {
        ftype3::NF3LNK
    } else if ft.is_block_device() {
        ftype3::NF3BLK
    } else if ft.is_char_device() {
        ftype3::NF3CHR
    } else if ft.is_socket() {
        ftype3::NF3SOCK
    } else if ft.is_fifo() {
        ftype3::NF3FIFO
    } else {
        ftype3::NF3REG
    }
}

pub fn fattr_from_metadata(meta: &Metadata) -> fattr3 {
    let rdev = meta.rdev();
    fattr3 {
        ftype: ftype_of(meta),
        mode: meta.mode() & 0o7777,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        used: meta.blocks() * 512,
        rdev: specdata3 {
            specdata1: major(rdev),
            specdata2: minor(rdev),
        },
        fsid: meta.dev(),
        fileid: meta.ino(),
        atime: nfstime(meta.atime(), meta.atime_nsec()),
        mtime: nfstime(meta.mtime(), meta.mtime_nsec()),
        ctime: nfstime(meta.ctime(), meta.ctime_nsec()),
    }
}

pub fn wcc_from(attr: &fattr3) -> wcc_attr {
    wcc_attr {
        size: attr.size,
        mtime: attr.mtime,
        ctime: attr.ctime,
    }
}

pub fn pre_op(attr: Option<&fattr3>) -> pre_op_attr {
    attr.map(|a| pre_op_attr::attributes(wcc_from(a)))
        .unwrap_or(pre_op_attr::Void)
}

pub fn post_op(attr: Option<fattr3>) -> post_op_attr {
    attr.map(post_op_attr::attributes).unwrap_or(post_op_attr::Void)
}

pub fn to_filetime(time: &nfstime3) -> FileTime {
    FileTime::from_unix_time(time.seconds as i64, time.nseconds)
}
