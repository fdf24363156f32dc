use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use crate::backingstore::memory_data_store::MemoryDataStore;
use crate::fhdb::{FhdbError, FileHandle, HandleStore};
use crate::kernel::access::HostAccess;
use crate::kernel::api::nfs::*;
use crate::kernel::fd_cache::FdCache;
use crate::kernel::handlers::nfs::basic_ops::*;
use crate::kernel::handlers::nfs::directory_ops::*;
use crate::kernel::handlers::nfs::file_ops::*;
use crate::kernel::handlers::nfs::fs_ops::*;
use crate::kernel::handlers::nfs::link_ops::*;
use crate::kernel::handlers::nfs::{handle_nfs, NfsRequest, NfsResponse};
use crate::kernel::protocol::context::{RPCContext, ServerConfig};
use crate::kernel::protocol::pipeline::Reply;
use crate::kernel::protocol::rpc::auth_unix;
use crate::settings::{AccessMode, SymlinkSupport};

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    root_fh: nfs_fh3,
    ctx: RPCContext,
}

async fn fixture_with(fd_cache_max: usize, configure: impl FnOnce(&mut ServerConfig)) -> Fixture {
    let dir = tempdir().expect("Failed to create temp dir");
    let root = dir.path().to_path_buf();
    let mut config = ServerConfig::default().with_exports(vec![root.clone()]);
    configure(&mut config);
    let ctx = RPCContext::new(
        Arc::new(HandleStore::with_store(Arc::new(MemoryDataStore::new()))),
        Arc::new(FdCache::new(fd_cache_max, Duration::from_secs(60))),
        config,
    );
    let root_fh = ctx.fhdb.lookup_or_create(&root).await.expect("root handle").to_fh3();
    Fixture {
        _dir: dir,
        root,
        root_fh,
        ctx,
    }
}

async fn fixture() -> Fixture {
    fixture_with(16, |_| {}).await
}

fn dirop(dir: &nfs_fh3, name: &str) -> diropargs3 {
    diropargs3 {
        dir: dir.clone(),
        name: name.as_bytes().to_vec(),
    }
}

fn handle_of(reply: &CREATE3resok) -> nfs_fh3 {
    match &reply.obj {
        post_op_fh3::handle(fh) => fh.clone(),
        post_op_fh3::Void => panic!("create returned no handle"),
    }
}

fn own_uid(path: &Path) -> u32 {
    std::fs::metadata(path).expect("stat").uid()
}

impl Fixture {
    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn create(&self, name: &str, how: createhow3) -> Reply<CREATE3resok> {
        nfsproc3_create(
            CREATE3args {
                dirops: dirop(&self.root_fh, name),
                how,
            },
            &self.ctx,
        )
        .await
    }

    async fn create_file(&self, name: &str) -> nfs_fh3 {
        let reply = self.create(name, createhow3::UNCHECKED(sattr3::default())).await;
        assert_eq!(reply.status, nfsstat3::NFS3_OK, "create {}", name);
        handle_of(&reply.body)
    }

    async fn lookup(&self, name: &str) -> Result<LOOKUP3resok, nfsstat3> {
        nfsproc3_lookup(
            LOOKUP3args {
                what: dirop(&self.root_fh, name),
            },
            &self.ctx,
        )
        .await
        .into_result()
    }

    async fn write(&self, file: &nfs_fh3, offset: u64, data: &[u8], stable: stable_how) -> Result<WRITE3resok, nfsstat3> {
        nfsproc3_write(
            WRITE3args {
                file: file.clone(),
                offset,
                count: data.len() as u32,
                stable,
                data: data.to_vec(),
            },
            &self.ctx,
        )
        .await
        .into_result()
    }

    async fn read(&self, file: &nfs_fh3, offset: u64, count: u32) -> Result<READ3resok, nfsstat3> {
        nfsproc3_read(
            READ3args {
                file: file.clone(),
                offset,
                count,
            },
            &self.ctx,
        )
        .await
        .into_result()
    }

    async fn rename(&self, from: &str, to: &str) -> nfsstat3 {
        nfsproc3_rename(
            RENAME3args {
                from: dirop(&self.root_fh, from),
                to: dirop(&self.root_fh, to),
            },
            &self.ctx,
        )
        .await
        .status
    }

    async fn resolve(&self, fh: &nfs_fh3) -> Result<PathBuf, FhdbError> {
        let handle = FileHandle::try_from(fh)?;
        self.ctx.fhdb.resolve(&handle).await
    }

    async fn readdir(&self, cookie: cookie3, cookieverf: cookieverf3, count: u32) -> Result<READDIR3resok, nfsstat3> {
        nfsproc3_readdir(
            READDIR3args {
                dir: self.root_fh.clone(),
                cookie,
                cookieverf,
                count,
            },
            &self.ctx,
        )
        .await
        .into_result()
    }

    async fn readdirplus(
        &self,
        cookie: cookie3,
        cookieverf: cookieverf3,
        dircount: u32,
        maxcount: u32,
    ) -> Result<READDIRPLUS3resok, nfsstat3> {
        nfsproc3_readdirplus(
            READDIRPLUS3args {
                dir: self.root_fh.clone(),
                cookie,
                cookieverf,
                dircount,
                maxcount,
            },
            &self.ctx,
        )
        .await
        .into_result()
    }
}

#[tokio::test]
async fn test_handle_follows_the_file_through_its_life() {
    let fx = fixture().await;
    let created = fx.create_file("a").await;

    let looked_up = fx.lookup("a").await.expect("lookup a");
    assert_eq!(looked_up.object, created);

    let payload = vec![7u8; 100];
    let written = fx.write(&created, 0, &payload, stable_how::FILE_SYNC).await.expect("write");
    assert_eq!(written.count, 100);
    assert_eq!(written.committed, stable_how::FILE_SYNC);

    let read = fx.read(&created, 0, 200).await.expect("read");
    assert_eq!(read.count, 100);
    assert!(read.eof);
    assert_eq!(read.data, payload);

    assert_eq!(fx.rename("a", "b").await, nfsstat3::NFS3_OK);
    assert_eq!(fx.resolve(&created).await.expect("resolve after rename"), fx.path("b"));
    assert_eq!(fx.lookup("b").await.expect("lookup b").object, created);
    assert_eq!(fx.lookup("a").await.unwrap_err(), nfsstat3::NFS3ERR_NOENT);

    let removed = nfsproc3_remove(
        REMOVE3args {
            object: dirop(&fx.root_fh, "b"),
        },
        &fx.ctx,
    )
    .await;
    assert!(removed.is_ok());
    assert!(matches!(fx.resolve(&created).await, Err(FhdbError::NotFound(_))));

    let stale = nfsproc3_getattr(GETATTR3args { object: created }, &fx.ctx).await;
    assert_eq!(stale.status, nfsstat3::NFS3ERR_STALE);
}

#[tokio::test]
async fn test_create_modes() {
    let fx = fixture().await;
    std::fs::write(fx.path("exists"), b"old contents").expect("seed file");

    let exclusive = fx.create("exists", createhow3::EXCLUSIVE([1; 8])).await;
    assert_eq!(exclusive.status, nfsstat3::NFS3ERR_EXIST);
    let guarded = fx.create("exists", createhow3::GUARDED(sattr3::default())).await;
    assert_eq!(guarded.status, nfsstat3::NFS3ERR_EXIST);
    assert_eq!(std::fs::read(fx.path("exists")).expect("read"), b"old contents");

    let unchecked = fx.create("exists", createhow3::UNCHECKED(sattr3::default())).await;
    assert!(unchecked.is_ok());
    assert_eq!(std::fs::metadata(fx.path("exists")).expect("stat").len(), 0);

    let fresh = fx.create("fresh", createhow3::GUARDED(sattr3::default())).await;
    assert!(fresh.is_ok());
    let mode = std::fs::metadata(fx.path("fresh")).expect("stat").permissions().mode();
    assert_eq!(mode & 0o777, 0o644);
    match fresh.body.dir_wcc {
        wcc_data {
            before: pre_op_attr::attributes(_),
            after: post_op_attr::attributes(_),
        } => {}
        other => panic!("missing directory wcc data: {:?}", other),
    }

    let with_mode = fx
        .create(
            "private",
            createhow3::GUARDED(sattr3 {
                mode: set_mode3::mode(0o600),
                ..Default::default()
            }),
        )
        .await;
    assert!(with_mode.is_ok());
    let mode = std::fs::metadata(fx.path("private")).expect("stat").permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_unchecked_create_drops_the_cached_descriptor() {
    let fx = fixture().await;
    let fh = fx.create_file("f").await;
    fx.write(&fh, 0, b"0123456789", stable_how::UNSTABLE).await.expect("write");
    let handle = FileHandle::try_from(&fh).expect("handle");
    assert!(fx.ctx.fd_cache.has(&handle));

    assert!(fx.create("f", createhow3::UNCHECKED(sattr3::default())).await.is_ok());
    assert!(!fx.ctx.fd_cache.has(&handle));
    let read = fx.read(&fh, 0, 10).await.expect("read");
    assert_eq!(read.count, 0);
    assert!(read.eof);
}

#[tokio::test]
async fn test_readdir_pages_cover_every_entry() {
    let fx = fixture().await;
    let mut expected = BTreeSet::new();
    for i in 0..50 {
        let name = format!("file_{:02}", i);
        std::fs::write(fx.path(&name), b"").expect("seed");
        expected.insert(name.into_bytes());
    }

    let mut seen = Vec::new();
    let mut cookie = 0;
    let mut verifier = cookieverf3::default();
    let mut pages = 0;
    loop {
        let page = fx.readdir(cookie, verifier, 300).await.expect("readdir page");
        pages += 1;
        verifier = page.cookieverf;
        for entry in &page.reply.entries {
            seen.push(entry.name.clone());
        }
        if page.reply.eof {
            break;
        }
        cookie = page.reply.entries.last().expect("non-empty page").cookie;
    }

    assert!(pages > 1);
    assert_eq!(seen.len(), expected.len());
    assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), expected);

    let everything = fx.readdir(0, cookieverf3::default(), 1 << 20).await.expect("single page");
    assert!(everything.reply.eof);
    assert_eq!(everything.reply.entries.len(), 50);
    let cookies: Vec<u64> = everything.reply.entries.iter().map(|e| e.cookie).collect();
    assert_eq!(cookies, (1..=50).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_readdir_rejects_a_foreign_verifier() {
    let fx = fixture().await;
    std::fs::write(fx.path("x"), b"").expect("seed");
    assert_eq!(fx.readdir(0, [9; 8], 4096).await.unwrap_err(), nfsstat3::NFS3ERR_BAD_COOKIE);
    assert_eq!(fx.readdir(3, [9; 8], 4096).await.unwrap_err(), nfsstat3::NFS3ERR_BAD_COOKIE);

    let first = fx.readdir(0, cookieverf3::default(), 4096).await.expect("readdir");
    let again = fx.readdir(0, first.cookieverf, 4096).await.expect("same verifier");
    assert_eq!(again.reply.entries, first.reply.entries);
}

#[tokio::test]
async fn test_readdir_too_small_for_one_entry() {
    let fx = fixture().await;
    std::fs::write(fx.path("x"), b"").expect("seed");
    assert_eq!(fx.readdir(0, cookieverf3::default(), 120).await.unwrap_err(), nfsstat3::NFS3ERR_TOOSMALL);

    // nothing left to send is not an error
    let past_end = fx.readdir(1, cookieverf3::default(), 120).await.expect("readdir");
    assert!(past_end.reply.entries.is_empty());
    assert!(past_end.reply.eof);
}

#[tokio::test]
async fn test_readdir_of_a_file_is_notdir() {
    let fx = fixture().await;
    let fh = fx.create_file("plain").await;
    let reply = nfsproc3_readdir(
        READDIR3args {
            dir: fh,
            count: 4096,
            ..Default::default()
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(reply.status, nfsstat3::NFS3ERR_NOTDIR);
}

#[tokio::test]
async fn test_readdirplus_returns_resolvable_handles_within_budget() {
    let fx = fixture().await;
    for name in ["aa", "bb", "cc", "dd", "ee"] {
        std::fs::write(fx.path(name), name.as_bytes()).expect("seed");
    }
    // two-byte names pad to an 8 byte xdr string: 28 + 8 + 84 + 64 per entry
    let two_entries = 116 + 2 * 184;

    let page = fx.readdirplus(0, cookieverf3::default(), 4096, two_entries).await.expect("page");
    assert_eq!(page.reply.entries.len(), 2);
    assert!(!page.reply.eof);

    let mut cookie = 0;
    let mut names = Vec::new();
    loop {
        let page = fx.readdirplus(cookie, page.cookieverf, 4096, two_entries).await.expect("page");
        for entry in &page.reply.entries {
            let fh = match &entry.name_handle {
                post_op_fh3::handle(fh) => fh.clone(),
                post_op_fh3::Void => panic!("entry without handle"),
            };
            let name = String::from_utf8(entry.name.clone()).expect("utf8");
            assert_eq!(fx.resolve(&fh).await.expect("resolve"), fx.path(&name));
            let attr = entry.name_attributes.attrs().expect("attributes");
            assert_eq!(attr.size, 2);
            assert_eq!(attr.fileid, entry.fileid);
            names.push(name);
        }
        if page.reply.eof {
            break;
        }
        cookie = page.reply.entries.last().expect("entries").cookie;
    }
    assert_eq!(names, vec!["aa", "bb", "cc", "dd", "ee"]);

    // the directory budget binds independently of maxcount
    let narrow = fx.readdirplus(0, cookieverf3::default(), 2 * 28, 1 << 20).await.expect("page");
    assert_eq!(narrow.reply.entries.len(), 2);
    assert!(!narrow.reply.eof);
}

#[tokio::test]
async fn test_mkdir_and_rmdir() {
    let fx = fixture().await;
    let made = nfsproc3_mkdir(
        MKDIR3args {
            dirops: dirop(&fx.root_fh, "d"),
            attributes: sattr3::default(),
        },
        &fx.ctx,
    )
    .await;
    assert!(made.is_ok());
    let dir_fh = handle_of(&made.body);
    let meta = std::fs::metadata(fx.path("d")).expect("stat");
    assert!(meta.is_dir());
    assert_eq!(meta.permissions().mode() & 0o777, 0o755);

    let again = nfsproc3_mkdir(
        MKDIR3args {
            dirops: dirop(&fx.root_fh, "d"),
            attributes: sattr3::default(),
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(again.status, nfsstat3::NFS3ERR_EXIST);

    std::fs::write(fx.path("d/inner"), b"").expect("seed");
    let rmdir = |name: &str| RMDIR3args {
        object: dirop(&fx.root_fh, name),
    };
    assert_eq!(nfsproc3_rmdir(rmdir("d"), &fx.ctx).await.status, nfsstat3::NFS3ERR_NOTEMPTY);

    std::fs::remove_file(fx.path("d/inner")).expect("cleanup");
    assert!(nfsproc3_rmdir(rmdir("d"), &fx.ctx).await.is_ok());
    assert!(!fx.path("d").exists());
    assert!(matches!(fx.resolve(&dir_fh).await, Err(FhdbError::NotFound(_))));

    // a directory that is already gone still succeeds
    assert!(nfsproc3_rmdir(rmdir("d"), &fx.ctx).await.is_ok());
}

#[tokio::test]
async fn test_dot_names_never_name_an_entry() {
    let fx = fixture().await;
    let made = nfsproc3_mkdir(
        MKDIR3args {
            dirops: dirop(&fx.root_fh, "d"),
            attributes: sattr3::default(),
        },
        &fx.ctx,
    )
    .await;
    assert!(made.is_ok());
    let dir_fh = handle_of(&made.body);
    let file_fh = fx.create_file("f").await;

    let rmdir = |dir: &nfs_fh3, name: &str| RMDIR3args {
        object: dirop(dir, name),
    };
    assert_eq!(nfsproc3_rmdir(rmdir(&dir_fh, "."), &fx.ctx).await.status, nfsstat3::NFS3ERR_INVAL);
    assert_eq!(nfsproc3_rmdir(rmdir(&dir_fh, ".."), &fx.ctx).await.status, nfsstat3::NFS3ERR_EXIST);
    assert_eq!(nfsproc3_rmdir(rmdir(&fx.root_fh, ".."), &fx.ctx).await.status, nfsstat3::NFS3ERR_EXIST);
    assert!(fx.path("d").is_dir());
    assert!(fx.root.is_dir());
    assert_eq!(fx.resolve(&dir_fh).await.expect("directory keeps its handle"), fx.path("d"));
    assert_eq!(fx.resolve(&fx.root_fh).await.expect("root keeps its handle"), fx.root);

    let remove = nfsproc3_remove(
        REMOVE3args {
            object: dirop(&dir_fh, "."),
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(remove.status, nfsstat3::NFS3ERR_INVAL);

    let rename = |from: diropargs3, to: diropargs3| RENAME3args { from, to };
    let status = nfsproc3_rename(rename(dirop(&dir_fh, "."), dirop(&fx.root_fh, "moved")), &fx.ctx).await.status;
    assert_eq!(status, nfsstat3::NFS3ERR_INVAL);
    let status = nfsproc3_rename(rename(dirop(&fx.root_fh, "f"), dirop(&dir_fh, "..")), &fx.ctx).await.status;
    assert_eq!(status, nfsstat3::NFS3ERR_EXIST);
    assert_eq!(fx.resolve(&file_fh).await.expect("file keeps its path"), fx.path("f"));
    assert_eq!(fx.resolve(&dir_fh).await.expect("directory keeps its path"), fx.path("d"));

    let mkdir = nfsproc3_mkdir(
        MKDIR3args {
            dirops: dirop(&dir_fh, ".."),
            attributes: sattr3::default(),
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(mkdir.status, nfsstat3::NFS3ERR_EXIST);
    assert_eq!(fx.create(".", createhow3::UNCHECKED(sattr3::default())).await.status, nfsstat3::NFS3ERR_INVAL);

    let link = nfsproc3_link(
        LINK3args {
            file: file_fh,
            link: dirop(&dir_fh, "."),
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(link.status, nfsstat3::NFS3ERR_INVAL);

    // lookup still follows the dot names
    assert_eq!(fx.lookup(".").await.expect("dot").object, fx.root_fh);
}

#[tokio::test]
async fn test_remove_of_a_directory_is_isdir() {
    let fx = fixture().await;
    std::fs::create_dir(fx.path("sub")).expect("mkdir");
    let reply = nfsproc3_remove(
        REMOVE3args {
            object: dirop(&fx.root_fh, "sub"),
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(reply.status, nfsstat3::NFS3ERR_ISDIR);
    assert!(fx.path("sub").is_dir());
}

#[tokio::test]
async fn test_rename_over_an_existing_file_displaces_its_handle() {
    let fx = fixture().await;
    let x = fx.create_file("x").await;
    let y = fx.create_file("y").await;
    fx.write(&y, 0, b"yy", stable_how::UNSTABLE).await.expect("write y");
    let y_handle = FileHandle::try_from(&y).expect("handle");
    assert!(fx.ctx.fd_cache.has(&y_handle));

    assert_eq!(fx.rename("x", "y").await, nfsstat3::NFS3_OK);
    assert_eq!(fx.resolve(&x).await.expect("resolve x"), fx.path("y"));
    assert!(matches!(fx.resolve(&y).await, Err(FhdbError::NotFound(_))));
    assert!(!fx.ctx.fd_cache.has(&y_handle));
}

#[tokio::test]
async fn test_rename_of_a_directory_is_isdir() {
    let fx = fixture().await;
    std::fs::create_dir(fx.path("dir")).expect("mkdir");
    assert_eq!(fx.rename("dir", "moved").await, nfsstat3::NFS3ERR_ISDIR);
    assert!(fx.path("dir").is_dir());
}

#[tokio::test]
async fn test_link() {
    let fx = fixture().await;
    let file = fx.create_file("orig").await;
    let reply = nfsproc3_link(
        LINK3args {
            file: file.clone(),
            link: dirop(&fx.root_fh, "alias"),
        },
        &fx.ctx,
    )
    .await;
    assert!(reply.is_ok());
    assert_eq!(reply.body.file_attributes.attrs().expect("attrs").nlink, 2);
    assert_eq!(
        std::fs::metadata(fx.path("alias")).expect("stat").ino(),
        std::fs::metadata(fx.path("orig")).expect("stat").ino()
    );
    // the source keeps its handle
    assert_eq!(fx.resolve(&file).await.expect("resolve"), fx.path("orig"));

    std::fs::create_dir(fx.path("dir")).expect("mkdir");
    let dir = fx.lookup("dir").await.expect("lookup dir").object;
    let reply = nfsproc3_link(
        LINK3args {
            file: dir,
            link: dirop(&fx.root_fh, "dir_alias"),
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(reply.status, nfsstat3::NFS3ERR_NOTSUPP);
}

#[tokio::test]
async fn test_symlink_and_readlink() {
    let fx = fixture().await;
    let reply = nfsproc3_symlink(
        SYMLINK3args {
            dirops: dirop(&fx.root_fh, "s"),
            symlink: symlinkdata3 {
                symlink_attributes: sattr3::default(),
                symlink_data: b"target".to_vec(),
            },
        },
        &fx.ctx,
    )
    .await;
    assert!(reply.is_ok());
    let link = handle_of(&reply.body);
    assert_eq!(reply.body.obj_attributes.attrs().expect("attrs").ftype, ftype3::NF3LNK);

    let read = nfsproc3_readlink(READLINK3args { symlink: link }, &fx.ctx).await;
    assert!(read.is_ok());
    assert_eq!(read.body.data, b"target".to_vec());

    let plain = fx.create_file("plain").await;
    let read = nfsproc3_readlink(READLINK3args { symlink: plain }, &fx.ctx).await;
    assert_eq!(read.status, nfsstat3::NFS3ERR_INVAL);
}

#[tokio::test]
async fn test_symlink_can_be_switched_off() {
    let fx = fixture_with(16, |config| config.symlinks = SymlinkSupport::Unsupported).await;
    let reply = nfsproc3_symlink(
        SYMLINK3args {
            dirops: dirop(&fx.root_fh, "s"),
            symlink: symlinkdata3 {
                symlink_attributes: sattr3::default(),
                symlink_data: b"target".to_vec(),
            },
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(reply.status, nfsstat3::NFS3ERR_NOTSUPP);
    assert!(std::fs::symlink_metadata(fx.path("s")).is_err());
}

#[tokio::test]
async fn test_setattr() {
    let fx = fixture().await;
    let fh = fx.create_file("f").await;
    std::fs::write(fx.path("f"), b"0123456789").expect("seed");

    let reply = nfsproc3_setattr(
        SETATTR3args {
            object: fh.clone(),
            new_attributes: sattr3 {
                mode: set_mode3::mode(0o600),
                size: set_size3::size(3),
                mtime: set_mtime::SET_TO_CLIENT_TIME(nfstime3 {
                    seconds: 1_000_000,
                    nseconds: 0,
                }),
                ..Default::default()
            },
            guard: sattrguard3::Void,
        },
        &fx.ctx,
    )
    .await;
    assert!(reply.is_ok());
    let after = reply.body.obj_wcc.after.attrs().copied().expect("post-op attrs");
    assert_eq!(after.size, 3);
    assert_eq!(after.mode & 0o777, 0o600);
    assert_eq!(after.mtime.seconds, 1_000_000);
    assert!(matches!(reply.body.obj_wcc.before, pre_op_attr::attributes(wcc) if wcc.size == 10));

    let guarded = nfsproc3_setattr(
        SETATTR3args {
            object: fh,
            new_attributes: sattr3 {
                size: set_size3::size(0),
                ..Default::default()
            },
            guard: sattrguard3::obj_ctime(nfstime3 { seconds: 1, nseconds: 1 }),
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(guarded.status, nfsstat3::NFS3ERR_NOT_SYNC);
    assert_eq!(std::fs::metadata(fx.path("f")).expect("stat").len(), 3);
}

#[tokio::test]
async fn test_access_mode_bits() {
    let fx = fixture_with(16, |config| config.access = AccessMode::ModeBits).await;
    let fh = fx.create_file("secret").await;
    std::fs::set_permissions(fx.path("secret"), std::fs::Permissions::from_mode(0o600)).expect("chmod");
    let owner = own_uid(&fx.path("secret"));
    let asked = ACCESS3_READ | ACCESS3_MODIFY;

    let as_owner = fx.ctx.for_client(2049, fx.ctx.client_addr, Some(auth_unix::new(owner, 0)));
    let reply = nfsproc3_access(
        ACCESS3args {
            object: fh.clone(),
            access: asked,
        },
        &as_owner,
    )
    .await;
    assert!(reply.is_ok());
    assert_eq!(reply.body.access, asked);

    let stranger = fx.ctx.for_client(2049, fx.ctx.client_addr, Some(auth_unix::new(owner + 1, 0)));
    let reply = nfsproc3_access(ACCESS3args { object: fh, access: asked }, &stranger).await;
    assert_eq!(reply.status, nfsstat3::NFS3ERR_ACCES);
}

#[tokio::test]
async fn test_access_permissive_grants_everything() {
    let fx = fixture().await;
    let fh = fx.create_file("f").await;
    std::fs::set_permissions(fx.path("f"), std::fs::Permissions::from_mode(0o000)).expect("chmod");
    let reply = nfsproc3_access(
        ACCESS3args {
            object: fh,
            access: ACCESS3_READ | ACCESS3_EXECUTE,
        },
        &fx.ctx,
    )
    .await;
    assert_eq!(reply.body.access, ACCESS3_READ | ACCESS3_EXECUTE);
}

#[tokio::test]
async fn test_denied_hosts_are_refused_every_procedure() {
    let client: SocketAddr = "10.9.9.9:1000".parse().expect("addr");
    let fx = fixture_with(16, |config| config.hosts = HostAccess::new(None, vec![client.ip()])).await;
    let denied = fx.ctx.for_client(2049, client, None);

    let response = handle_nfs(NfsRequest::Null, &denied).await;
    assert_eq!(response.status(), nfsstat3::NFS3ERR_ACCES);
    let response = handle_nfs(
        NfsRequest::Getattr(GETATTR3args {
            object: fx.root_fh.clone(),
        }),
        &denied,
    )
    .await;
    assert_eq!(response.status(), nfsstat3::NFS3ERR_ACCES);

    assert!(handle_nfs(NfsRequest::Null, &fx.ctx).await.is_ok());
}

#[tokio::test]
async fn test_unknown_and_malformed_handles() {
    let fx = fixture().await;
    let unknown = FileHandle::generate().to_fh3();
    let reply = nfsproc3_getattr(GETATTR3args { object: unknown }, &fx.ctx).await;
    assert_eq!(reply.status, nfsstat3::NFS3ERR_STALE);

    let garbage = nfs_fh3 { data: vec![1, 2, 3] };
    let reply = nfsproc3_getattr(GETATTR3args { object: garbage }, &fx.ctx).await;
    assert_eq!(reply.status, nfsstat3::NFS3ERR_BADHANDLE);
}

#[tokio::test]
async fn test_lookup_names() {
    let fx = fixture().await;
    assert_eq!(fx.lookup("missing").await.unwrap_err(), nfsstat3::NFS3ERR_NOENT);
    assert_eq!(fx.lookup("").await.unwrap_err(), nfsstat3::NFS3ERR_INVAL);
    assert_eq!(fx.lookup("a/b").await.unwrap_err(), nfsstat3::NFS3ERR_INVAL);
    assert_eq!(fx.lookup(&"n".repeat(1025)).await.unwrap_err(), nfsstat3::NFS3ERR_NAMETOOLONG);
    assert_eq!(fx.lookup(".").await.expect("dot").object, fx.root_fh);
    assert_eq!(fx.lookup("..").await.expect("dotdot").object, fx.root_fh);
}

#[tokio::test]
async fn test_concurrent_first_lookups_agree() {
    let fx = fixture().await;
    std::fs::write(fx.path("shared"), b"").expect("seed");
    let lookups = (0..8).map(|_| fx.lookup("shared"));
    let handles: BTreeSet<Vec<u8>> = futures::future::join_all(lookups)
        .await
        .into_iter()
        .map(|reply| reply.expect("lookup").object.data)
        .collect();
    assert_eq!(handles.len(), 1);
}

#[tokio::test]
async fn test_fd_cache_stays_bounded() {
    let fx = fixture_with(1, |_| {}).await;
    let a = fx.create_file("a").await;
    let b = fx.create_file("b").await;
    std::fs::write(fx.path("a"), b"aaaa").expect("seed a");
    std::fs::write(fx.path("b"), b"bbbb").expect("seed b");
    let (ha, hb) = (FileHandle::try_from(&a).expect("a"), FileHandle::try_from(&b).expect("b"));

    // partial reads keep the descriptor cached
    assert!(!fx.read(&a, 0, 2).await.expect("read a").eof);
    assert!(fx.ctx.fd_cache.has(&ha));
    assert!(!fx.read(&b, 0, 2).await.expect("read b").eof);
    assert!(fx.ctx.fd_cache.has(&hb));
    assert!(!fx.ctx.fd_cache.has(&ha));
    assert_eq!(fx.ctx.fd_cache.len(), 1);

    let again = fx.read(&a, 2, 10).await.expect("reopen a");
    assert_eq!(again.data, b"aa".to_vec());
    assert!(again.eof);
}

#[tokio::test]
async fn test_unstable_writes_commit_with_the_server_verifier() {
    let fx = fixture().await;
    let fh = fx.create_file("f").await;
    let written = fx.write(&fh, 0, b"data", stable_how::UNSTABLE).await.expect("write");
    assert_eq!(written.committed, stable_how::UNSTABLE);
    assert_eq!(written.verf, fx.ctx.config.write_verifier);

    let committed = nfsproc3_commit(
        COMMIT3args {
            file: fh,
            offset: 0,
            count: 0,
        },
        &fx.ctx,
    )
    .await;
    assert!(committed.is_ok());
    assert_eq!(committed.body.verf, written.verf);
    assert_eq!(std::fs::read(fx.path("f")).expect("read"), b"data");
}

#[tokio::test]
async fn test_filesystem_information() {
    let fx = fixture().await;
    let info = nfsproc3_fsinfo(FSINFO3args { fsroot: fx.root_fh.clone() }, &fx.ctx).await;
    assert!(info.is_ok());
    assert_eq!(info.body.rtmax, 65536);
    assert_eq!(info.body.wtpref, 32768);
    assert_eq!(info.body.dtpref, 8192);
    assert_eq!(info.body.maxfilesize, 1 << 40);
    assert_ne!(info.body.properties & FSF_SYMLINK, 0);

    let stat = nfsproc3_fsstat(FSSTAT3args { fsroot: fx.root_fh.clone() }, &fx.ctx).await;
    assert!(stat.is_ok());
    assert!(stat.body.tbytes >= stat.body.fbytes);

    let conf = nfsproc3_pathconf(PATHCONF3args { object: fx.root_fh.clone() }, &fx.ctx).await;
    assert_eq!(conf.body.name_max, 1024);
    assert!(conf.body.case_preserving);
    assert!(!conf.body.case_insensitive);
}

#[tokio::test]
async fn test_mknod_is_not_supported() {
    let fx = fixture().await;
    let response = handle_nfs(
        NfsRequest::Mknod(MKNOD3args {
            dirops: dirop(&fx.root_fh, "fifo"),
            ftype: ftype3::NF3FIFO,
        }),
        &fx.ctx,
    )
    .await;
    assert!(matches!(&response, NfsResponse::Mknod(_)));
    assert_eq!(response.status(), nfsstat3::NFS3ERR_NOTSUPP);
}
