//! End-to-end POSIX behavior of a pool: the basic scenarios plus the
//! quantified properties (sparse files, hole punching, truncate,
//! append, seek data/hole, link counts, concurrency, rollback).

use pmfs::{
    Caps, Error, FallocateMode, OpenFlags, Pool, Whence, ALLPERMS, S_IFLNK, S_IFMT, S_IFREG,
};

fn test_pool() -> Pool {
    let _ = env_logger::builder().is_test(true).try_init();
    Pool::new(64 << 20).expect("test pool")
}

fn read_all(pool: &Pool, path: &str) -> Vec<u8> {
    let file = pool.open(path, OpenFlags::RDONLY, 0).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = pool.read(&file, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    pool.close(file);
    out
}

#[test]
fn basic_create_write_read_stat() {
    let pool = test_pool();

    let file = pool
        .open("/a", OpenFlags::CREAT | OpenFlags::WRONLY, 0o600)
        .unwrap();
    assert_eq!(pool.write(&file, b"hello").unwrap(), 5);
    pool.close(file);

    let file = pool.open("/a", OpenFlags::RDONLY, 0).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(pool.read(&file, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    pool.close(file);

    let st = pool.stat("/a").unwrap();
    assert_eq!(st.size, 5);
    assert_eq!(st.mode & S_IFMT, S_IFREG);
    assert_eq!(st.mode & ALLPERMS, 0o600);
    assert_eq!(st.nlink, 1);
}

#[test]
fn sparse_file_reads_zeros() {
    let pool = test_pool();

    let file = pool
        .open("/b", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .unwrap();
    assert_eq!(pool.lseek(&file, 4096, Whence::Set).unwrap(), 4096);
    assert_eq!(pool.write(&file, b"X").unwrap(), 1);
    pool.close(file);

    assert_eq!(pool.stat("/b").unwrap().size, 4097);

    let data = read_all(&pool, "/b");
    assert_eq!(data.len(), 4097);
    assert!(data[..4096].iter().all(|b| *b == 0));
    assert_eq!(data[4096], b'X');
}

#[test]
fn hole_punch_zeroes_range_and_preserves_rest() {
    let pool = test_pool();

    let file = pool
        .open("/c", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .unwrap();
    let payload = vec![b'A'; 8192];
    assert_eq!(pool.write(&file, &payload).unwrap(), 8192);

    pool.fallocate(
        &file,
        FallocateMode::PUNCH_HOLE | FallocateMode::KEEP_SIZE,
        4096,
        4096,
    )
    .unwrap();
    pool.close(file);

    assert_eq!(pool.stat("/c").unwrap().size, 8192);
    let data = read_all(&pool, "/c");
    assert!(data[..4096].iter().all(|b| *b == b'A'));
    assert!(data[4096..].iter().all(|b| *b == 0));
}

#[test]
fn truncate_shrinks_and_grows() {
    let pool = test_pool();

    let file = pool
        .open("/t", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .unwrap();
    pool.write(&file, &vec![b'Z'; 10000]).unwrap();

    pool.ftruncate(&file, 3).unwrap();
    assert_eq!(pool.fstat(&file).size, 3);
    assert_eq!(read_all(&pool, "/t"), b"ZZZ");

    // growing truncate exposes zeros
    pool.ftruncate(&file, 10).unwrap();
    assert_eq!(pool.fstat(&file).size, 10);
    assert_eq!(read_all(&pool, "/t"), b"ZZZ\0\0\0\0\0\0\0");
    pool.close(file);
}

#[test]
fn append_writes_land_at_eof() {
    let pool = test_pool();

    let file = pool
        .open("/log", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    pool.write(&file, b"one").unwrap();
    pool.close(file);

    let file = pool
        .open("/log", OpenFlags::WRONLY | OpenFlags::APPEND, 0)
        .unwrap();
    let before = pool.fstat(&file).size;
    assert_eq!(pool.write(&file, b"two").unwrap(), 3);
    let st = pool.fstat(&file);
    assert_eq!(st.size, before + 3);
    pool.close(file);

    assert_eq!(read_all(&pool, "/log"), b"onetwo");
}

#[test]
fn seek_data_and_seek_hole() {
    let pool = test_pool();

    let file = pool
        .open("/sparse", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .unwrap();
    // data at 64k and at the tail, a hole on each side of the middle
    pool.pwrite(&file, &vec![1u8; 4096], 65536).unwrap();
    pool.pwrite(&file, &[2u8], 262143).unwrap();

    let data = pool.lseek(&file, 0, Whence::Data).unwrap();
    assert_eq!(data, 65536);
    let hole = pool.lseek(&file, data, Whence::Hole).unwrap();
    assert!(hole >= data + 4096, "hole at {hole}");

    // inside the data block, SEEK_DATA is the identity
    assert_eq!(pool.lseek(&file, 65540, Whence::Data).unwrap(), 65540);
    // in the trailing hole, SEEK_HOLE is the identity
    assert_eq!(pool.lseek(&file, 200000, Whence::Hole).unwrap(), 200000);
    // past EOF
    assert!(matches!(
        pool.lseek(&file, 262145, Whence::Data),
        Err(Error::NxIo)
    ));
    pool.close(file);
}

#[test]
fn link_then_unlink_keeps_content() {
    let pool = test_pool();

    let file = pool
        .open("/first", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    pool.write(&file, b"payload").unwrap();
    pool.close(file);

    let before = pool.stat("/first").unwrap();
    pool.link("/first", "/second").unwrap();
    assert_eq!(pool.stat("/second").unwrap().nlink, 2);
    pool.unlink("/first").unwrap();

    let after = pool.stat("/second").unwrap();
    assert_eq!(after.nlink, before.nlink);
    assert_eq!(after.ino, before.ino);
    assert_eq!(read_all(&pool, "/second"), b"payload");
    assert!(matches!(pool.stat("/first"), Err(Error::NoEntry)));
}

#[test]
fn unlinked_open_file_stays_readable_then_reclaims() {
    let pool = test_pool();

    let file = pool
        .open("/gone", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .unwrap();
    pool.write(&file, b"still here").unwrap();
    pool.unlink("/gone").unwrap();
    assert!(matches!(pool.stat("/gone"), Err(Error::NoEntry)));

    pool.lseek(&file, 0, Whence::Set).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(pool.read(&file, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"still here");

    let inodes_before = pool.stats().inodes;
    pool.close(file);
    assert_eq!(
        pool.stats().inodes,
        inodes_before - 1,
        "orphan reclaimed on last close"
    );
}

#[test]
fn tmpfile_is_anonymous_and_reclaimed() {
    let pool = test_pool();

    let file = pool
        .open("/", OpenFlags::TMPFILE | OpenFlags::RDWR, 0o600)
        .unwrap();
    pool.write(&file, b"scratch").unwrap();
    pool.lseek(&file, 0, Whence::Set).unwrap();
    let mut buf = [0u8; 7];
    assert_eq!(pool.read(&file, &mut buf).unwrap(), 7);
    assert_eq!(&buf, b"scratch");

    let inodes_before = pool.stats().inodes;
    pool.close(file);
    assert_eq!(pool.stats().inodes, inodes_before - 1);
}

#[test]
fn rename_moves_file() {
    let pool = test_pool();

    let file = pool
        .open("/a", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    pool.write(&file, b"content").unwrap();
    pool.close(file);

    pool.rename("/a", "/b").unwrap();
    assert!(matches!(pool.stat("/a"), Err(Error::NoEntry)));
    assert_eq!(read_all(&pool, "/b"), b"content");

    // across directories, replacing an existing target
    pool.mkdir("/dir", 0o755).unwrap();
    let file = pool
        .open("/dir/old", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    pool.write(&file, b"loser").unwrap();
    pool.close(file);
    pool.rename("/b", "/dir/old").unwrap();
    assert_eq!(read_all(&pool, "/dir/old"), b"content");

    // directories cannot be renamed
    assert!(matches!(pool.rename("/dir", "/dir2"), Err(Error::NotSup)));
}

#[test]
fn symlinks_resolve_and_loop() {
    let pool = test_pool();

    let file = pool
        .open("/target", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    pool.write(&file, b"via link").unwrap();
    pool.close(file);

    pool.symlink("/target", "/link").unwrap();
    assert_eq!(pool.readlink("/link").unwrap(), "/target");
    assert_eq!(read_all(&pool, "/link"), b"via link");

    let st = pool.lstat("/link").unwrap();
    assert_eq!(st.mode & S_IFMT, S_IFLNK);
    assert_eq!(pool.stat("/link").unwrap().mode & S_IFMT, S_IFREG);

    // NOFOLLOW refuses the link itself
    assert!(matches!(
        pool.open("/link", OpenFlags::NOFOLLOW, 0),
        Err(Error::Loop)
    ));

    // a self-loop trips the chase bound
    pool.symlink("/s", "/s").unwrap();
    assert!(matches!(
        pool.open("/s", OpenFlags::RDONLY, 0),
        Err(Error::Loop)
    ));

    // a long target spills into its own block and still reads back
    let deep = format!("/{}", "x".repeat(200));
    pool.symlink(&deep, "/deep").unwrap();
    assert_eq!(pool.readlink("/deep").unwrap(), deep);
}

#[test]
fn permissions_on_create_and_traverse() {
    let pool = test_pool();
    pool.setfsuid(1000); // act as a plain user owning what it creates

    pool.mkdir("/dir_rwx", 0o700).unwrap();
    pool.mkdir("/dir_rw-", 0o600).unwrap();
    pool.mkdir("/dir_--x", 0o100).unwrap();
    pool.mkdir("/dir_-wx", 0o300).unwrap();
    pool.mkdir("/dir_r--", 0o400).unwrap();

    // creating inside a directory needs write and execute on it
    assert!(matches!(
        pool.mkdir("/dir_rw-/sub", 0o700),
        Err(Error::Access)
    ));
    assert!(matches!(
        pool.mkdir("/dir_--x/sub", 0o700),
        Err(Error::Access)
    ));
    assert!(matches!(
        pool.mkdir("/dir_r--/sub", 0o700),
        Err(Error::Access)
    ));
    pool.mkdir("/dir_-wx/sub", 0o700).unwrap();
    pool.rmdir("/dir_-wx/sub").unwrap();

    // chdir needs execute
    assert!(matches!(pool.chdir("/dir_rw-"), Err(Error::Access)));
    pool.chdir("/dir_rwx").unwrap();
    pool.chdir("/").unwrap();

    // opening for read needs the read bit
    let f = pool
        .open("/dir_rwx/file", OpenFlags::CREAT | OpenFlags::WRONLY, 0o200)
        .unwrap();
    pool.close(f);
    assert!(matches!(
        pool.open("/dir_rwx/file", OpenFlags::RDONLY, 0),
        Err(Error::Access)
    ));
    let f = pool.open("/dir_rwx/file", OpenFlags::WRONLY, 0).unwrap();
    pool.close(f);
}

#[test]
fn chmod_and_chown_rules() {
    let pool = test_pool();
    pool.setfsuid(1000);
    pool.setfsgid(1000);

    let f = pool.create("/file", 0o644).unwrap();
    pool.close(f);

    pool.chmod("/file", 0o600).unwrap();
    assert_eq!(pool.stat("/file").unwrap().mode & ALLPERMS, 0o600);

    // a different fsuid may not chmod without CAP_FOWNER
    pool.setfsuid(2000);
    assert!(matches!(pool.chmod("/file", 0o644), Err(Error::Perm)));
    pool.setcap(Caps::FOWNER);
    pool.chmod("/file", 0o644).unwrap();
    pool.clrcap(Caps::FOWNER);
    pool.setfsuid(1000);

    // owner change requires CAP_CHOWN; a no-op "change" is allowed
    pool.chown("/file", Some(1000), None).unwrap();
    assert!(matches!(
        pool.chown("/file", Some(2000), None),
        Err(Error::Perm)
    ));
    pool.setcap(Caps::CHOWN);
    pool.chown("/file", Some(2000), Some(2000)).unwrap();
    let st = pool.stat("/file").unwrap();
    assert_eq!((st.uid, st.gid), (2000, 2000));
    pool.chown("/file", Some(1000), Some(1000)).unwrap();
    pool.clrcap(Caps::CHOWN);

    // the owner may move the file between its own groups only
    assert!(matches!(
        pool.chown("/file", None, Some(42)),
        Err(Error::Perm)
    ));
    pool.setgroups(&[42]);
    pool.chown("/file", None, Some(42)).unwrap();
    assert_eq!(pool.stat("/file").unwrap().gid, 42);
}

#[test]
fn setgid_directory_hands_down_group() {
    let pool = test_pool();
    pool.setfsuid(1000);
    pool.setfsgid(1000);

    pool.mkdir("/shared", 0o2775 & 0o777).unwrap();
    pool.chmod("/shared", 0o2775).unwrap();
    pool.setfsgid(2000);
    let f = pool.create("/shared/file", 0o644).unwrap();
    pool.close(f);
    assert_eq!(pool.stat("/shared/file").unwrap().gid, 1000);
    pool.mkdir("/shared/sub", 0o755).unwrap();
    let st = pool.stat("/shared/sub").unwrap();
    assert_eq!(st.gid, 1000);
    assert_ne!(st.mode & 0o2000, 0, "setgid inherited by subdirectory");
}

#[test]
fn open_flag_state_machine() {
    let pool = test_pool();

    assert!(matches!(
        pool.open("/missing", OpenFlags::RDONLY, 0),
        Err(Error::NoEntry)
    ));

    let f = pool
        .open("/x", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    pool.close(f);
    assert!(matches!(
        pool.open("/x", OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::WRONLY, 0o644),
        Err(Error::Exists)
    ));

    // CREAT|EXCL does not follow symlinks
    pool.symlink("/x", "/lx").unwrap();
    assert!(matches!(
        pool.open("/lx", OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::WRONLY, 0o644),
        Err(Error::Exists)
    ));

    // O_DIRECTORY insists on a directory
    assert!(matches!(
        pool.open("/x", OpenFlags::DIRECTORY, 0),
        Err(Error::NotDir)
    ));
    let d = pool.open("/", OpenFlags::DIRECTORY, 0).unwrap();
    pool.close(d);

    // opening a directory for writing is refused
    assert!(matches!(pool.open("/", OpenFlags::RDWR, 0), Err(Error::IsDir)));

    // O_TRUNC needs write access
    let f = pool.open("/x", OpenFlags::WRONLY, 0).unwrap();
    pool.write(&f, b"data").unwrap();
    pool.close(f);
    assert!(matches!(
        pool.open("/x", OpenFlags::TRUNC, 0),
        Err(Error::Access)
    ));
    let f = pool
        .open("/x", OpenFlags::WRONLY | OpenFlags::TRUNC, 0)
        .unwrap();
    pool.close(f);
    assert_eq!(pool.stat("/x").unwrap().size, 0);

    // PATH handles only anchor and stat
    let p = pool.open("/x", OpenFlags::PATH, 0).unwrap();
    let mut buf = [0u8; 1];
    assert!(matches!(pool.read(&p, &mut buf), Err(Error::BadFd)));
    assert!(matches!(pool.lseek(&p, 0, Whence::Set), Err(Error::BadFd)));
    assert!(matches!(pool.fchmod(&p, 0o600), Err(Error::BadFd)));
    pool.close(p);
}

#[test]
fn at_variants_anchor_on_handles() {
    let pool = test_pool();
    pool.mkdir("/anchor", 0o755).unwrap();
    let d = pool.open("/anchor", OpenFlags::DIRECTORY, 0).unwrap();

    let f = pool
        .openat(Some(&d), "rel", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    pool.write(&f, b"relative").unwrap();
    pool.close(f);
    assert_eq!(read_all(&pool, "/anchor/rel"), b"relative");
    assert_eq!(pool.fstatat(Some(&d), "rel", true).unwrap().size, 8);

    pool.mkdirat(Some(&d), "sub", 0o755).unwrap();
    pool.unlinkat(Some(&d), "sub", true).unwrap();
    pool.unlinkat(Some(&d), "rel", false).unwrap();
    pool.close(d);

    // cwd-relative paths follow chdir
    pool.chdir("/anchor").unwrap();
    let f = pool
        .open("cwdfile", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    pool.close(f);
    assert!(pool.stat("/anchor/cwdfile").is_ok());
    pool.chdir("/").unwrap();
}

#[test]
fn getdents_lists_entries() {
    let pool = test_pool();
    pool.mkdir("/list", 0o755).unwrap();
    for name in ["one", "two", "three"] {
        let f = pool
            .open(
                &format!("/list/{name}"),
                OpenFlags::CREAT | OpenFlags::WRONLY,
                0o644,
            )
            .unwrap();
        pool.close(f);
    }

    let d = pool.open("/list", OpenFlags::DIRECTORY, 0).unwrap();
    let mut names: Vec<String> = Vec::new();
    loop {
        let batch = pool.getdents(&d, 2).unwrap();
        if batch.is_empty() {
            break;
        }
        names.extend(batch.into_iter().map(|e| e.name));
    }
    pool.close(d);

    names.sort();
    assert_eq!(names, vec![".", "..", "one", "three", "two"]);
}

#[test]
fn sequential_write_read_round_trip() {
    let pool = test_pool();
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let file = pool
        .open("/stream", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .unwrap();
    let mut expected = Vec::new();
    for _ in 0..20 {
        let len = rng.gen_range(1..20000);
        let chunk: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        assert_eq!(pool.write(&file, &chunk).unwrap(), len);
        expected.extend_from_slice(&chunk);
    }
    pool.close(file);

    assert_eq!(pool.stat("/stream").unwrap().size, expected.len() as u64);
    assert_eq!(read_all(&pool, "/stream"), expected);
}

#[test]
fn pread_pwrite_and_vectored() {
    let pool = test_pool();
    let file = pool
        .open("/v", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .unwrap();

    assert_eq!(pool.writev(&file, &[b"abc", b"def"]).unwrap(), 6);
    assert_eq!(pool.pwrite(&file, b"XY", 1).unwrap(), 2);

    let mut a = [0u8; 2];
    let mut b = [0u8; 4];
    assert_eq!(pool.preadv(&file, &mut [&mut a[..], &mut b[..]], 0).unwrap(), 6);
    assert_eq!(&a, b"aX");
    assert_eq!(&b, b"Ydef");

    // handle offset was never disturbed by the positional calls
    let mut all = [0u8; 6];
    pool.lseek(&file, 0, Whence::Set).unwrap();
    let mut views: Vec<&mut [u8]> = Vec::new();
    let (left, right) = all.split_at_mut(3);
    views.push(left);
    views.push(right);
    assert_eq!(pool.readv(&file, &mut views).unwrap(), 6);
    assert_eq!(&all, b"aXYdef");
    pool.close(file);
}

#[test]
fn concurrent_writers() {
    use std::sync::Arc;

    let pool = Arc::new(test_pool());

    // disjoint files make independent progress
    let mut handles = Vec::new();
    for i in 0..4 {
        let pool = Arc::clone(&pool);
        handles.push(std::thread::spawn(move || {
            let path = format!("/par{i}");
            let f = pool
                .open(&path, OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
                .unwrap();
            for _ in 0..50 {
                pool.write(&f, &[i as u8; 997]).unwrap();
            }
            pool.close(f);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    for i in 0..4u8 {
        let data = read_all(&pool, &format!("/par{i}"));
        assert_eq!(data.len(), 50 * 997);
        assert!(data.iter().all(|b| *b == i));
    }

    // writers to one file serialise: single writes never interleave
    let shared = pool
        .open("/shared", OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::APPEND, 0o644)
        .unwrap();
    let shared = Arc::new(shared);
    let mut handles = Vec::new();
    for i in 0..4u8 {
        let pool = Arc::clone(&pool);
        let shared = Arc::clone(&shared);
        handles.push(std::thread::spawn(move || {
            for _ in 0..25 {
                pool.write(&shared, &[i; 251]).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let data = read_all(&pool, "/shared");
    assert_eq!(data.len(), 4 * 25 * 251);
    for chunk in data.chunks(251) {
        assert!(chunk.iter().all(|b| *b == chunk[0]), "interleaved write");
    }
}

#[test]
fn failed_allocation_rolls_back() {
    // a pool this small cannot hold a megabyte of data
    let pool = Pool::new(256 * 1024).unwrap();

    let file = pool
        .open("/victim", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
        .unwrap();
    pool.write(&file, b"intact").unwrap();
    let st_before = pool.fstat(&file);
    let stats_before = pool.stats();

    let big = vec![0xABu8; 4 << 20];
    assert!(matches!(
        pool.pwrite(&file, &big, 100),
        Err(Error::NoSpace)
    ));

    // nothing moved: size, content, and the object census are as before
    assert_eq!(pool.fstat(&file), st_before);
    assert_eq!(pool.stats(), stats_before);
    assert_eq!(read_all(&pool, "/victim"), b"intact");

    // the file still works after the abort
    assert_eq!(pool.pwrite(&file, b"more", 6).unwrap(), 4);
    assert_eq!(read_all(&pool, "/victim"), b"intactmore");
    pool.close(file);

    // a failing extension via truncate also rolls back
    let file = pool.open("/victim", OpenFlags::RDWR, 0).unwrap();
    assert!(matches!(
        pool.ftruncate(&file, 16 << 20),
        Err(Error::NoSpace)
    ));
    assert_eq!(pool.fstat(&file).size, 10);
    pool.close(file);
}

#[test]
fn rename_same_inode_is_a_noop() {
    let pool = test_pool();
    let f = pool.create("/orig", 0o644).unwrap();
    pool.close(f);
    pool.link("/orig", "/alias").unwrap();
    pool.rename("/orig", "/alias").unwrap();
    assert!(pool.stat("/orig").is_ok());
    assert!(pool.stat("/alias").is_ok());
}

#[test]
fn trailing_slash_and_dotdot_resolution() {
    let pool = test_pool();
    pool.mkdir("/d", 0o755).unwrap();
    let f = pool.create("/d/file", 0o644).unwrap();
    pool.close(f);

    // `..` above the root stays at the root
    assert_eq!(
        pool.stat("/../../d/file").unwrap().ino,
        pool.stat("/d/file").unwrap().ino
    );
    assert_eq!(pool.stat("/d/.").unwrap().ino, pool.stat("/d").unwrap().ino);

    // trailing slash demands a directory
    assert!(matches!(pool.stat("/d/file/"), Err(Error::NotDir)));
    assert!(pool.stat("/d/").is_ok());
    assert!(matches!(
        pool.open("/d/file/", OpenFlags::RDONLY, 0),
        Err(Error::NotDir)
    ));
}

#[test]
fn name_length_limit() {
    let pool = test_pool();
    let ok = "n".repeat(255);
    let too_long = "n".repeat(256);

    let f = pool.create(&format!("/{ok}"), 0o644).unwrap();
    pool.close(f);
    assert!(pool.stat(&format!("/{ok}")).is_ok());
    assert!(matches!(
        pool.create(&format!("/{too_long}"), 0o644),
        Err(Error::NameTooLong)
    ));
}
