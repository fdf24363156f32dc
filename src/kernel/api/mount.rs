#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

use num_derive::{FromPrimitive, ToPrimitive};

pub const PROGRAM: u32 = 100005;
pub const VERSION: u32 = 3;

pub const MNTPATHLEN: usize = 1024;
pub const MNTNAMLEN: usize = 255;
pub const FHSIZE3: usize = 64;

pub type dirpath = Vec<u8>;
pub type name = Vec<u8>;
pub type fhandle3 = Vec<u8>;

pub const AUTH_NULL: u32 = 0;
pub const AUTH_UNIX: u32 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum mountstat3 {
    #[default]
    MNT3_OK = 0,
    MNT3ERR_PERM = 1,
    MNT3ERR_NOENT = 2,
    MNT3ERR_IO = 5,
    MNT3ERR_ACCES = 13,
    MNT3ERR_NOTDIR = 20,
    MNT3ERR_INVAL = 22,
    MNT3ERR_NAMETOOLONG = 63,
    MNT3ERR_NOTSUPP = 10004,
    MNT3ERR_SERVERFAULT = 10006,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct mountres3_ok {
    pub fhandle: fhandle3,
    pub auth_flavors: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct mountbody {
    pub ml_hostname: name,
    pub ml_directory: dirpath,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct exportnode {
    pub ex_dir: dirpath,
    pub ex_groups: Vec<name>,
}
