//! Consistency invariants and boundary behaviors, cross-checked against the
//! raw image bytes after every flush.

mod common;

use common::{fresh_disk, raw_counts, ImageSpec};
use extfs::{Error, Ext4, MountOptions, OpenFlags, SeekWhence};

fn mount(disk: &common::SharedDisk) -> Ext4<common::SharedDisk> {
    Ext4::mount(disk.clone(), MountOptions::default()).unwrap()
}

/// The free-count words must equal the clear-bit population of their
/// bitmaps, on disk, after any flushed operation sequence.
fn assert_counts_consistent(disk: &common::SharedDisk) {
    let counts = raw_counts(&disk.snapshot());
    assert_eq!(counts.sb_free_blocks, counts.bitmap_free_blocks);
    assert_eq!(counts.sb_free_inodes, counts.bitmap_free_inodes);
}

#[test]
fn free_counts_track_bitmaps_across_operations() {
    for spec in [ImageSpec::ext2(), ImageSpec::ext4()] {
        let disk = fresh_disk(spec);
        let fs = mount(&disk);

        fs.mkdir("/dir", 0o755).unwrap();
        let mut f = fs
            .open("/dir/file", OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
            .unwrap();
        f.write(&vec![7u8; 50_000]).unwrap();
        f.close().unwrap();
        fs.flush().unwrap();
        assert_counts_consistent(&disk);

        fs.unlink("/dir/file").unwrap();
        fs.rmdir("/dir").unwrap();
        fs.flush().unwrap();
        assert_counts_consistent(&disk);
        fs.unmount().unwrap();
    }
}

#[test]
fn removing_everything_restores_the_free_pool() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    fs.flush().unwrap();
    let before = raw_counts(&disk.snapshot());

    fs.mkdir("/a", 0o755).unwrap();
    for i in 0..30 {
        let mut f = fs
            .open(&format!("/a/f{i}"), OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
            .unwrap();
        f.write(&vec![i as u8; 4096]).unwrap();
        f.close().unwrap();
    }
    for i in 0..30 {
        fs.unlink(&format!("/a/f{i}")).unwrap();
    }
    fs.rmdir("/a").unwrap();
    fs.flush().unwrap();

    let after = raw_counts(&disk.snapshot());
    assert_eq!(before.sb_free_blocks, after.sb_free_blocks);
    assert_eq!(before.sb_free_inodes, after.sb_free_inodes);
    assert_counts_consistent(&disk);

    let info = fs.statfs().unwrap();
    assert_eq!(info.block_size, 1024);
    assert_eq!(info.free_blocks, u64::from(after.sb_free_blocks));
    assert_eq!(info.free_inodes, after.sb_free_inodes);
    fs.unmount().unwrap();
}

#[test]
fn link_then_unlink_leaves_the_file_as_before() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);

    let mut f = fs
        .open("/orig", OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();
    f.write(b"hard link me").unwrap();
    f.close().unwrap();
    fs.flush().unwrap();
    let before = raw_counts(&disk.snapshot());
    assert_eq!(fs.stat("/orig").unwrap().nlink, 1);

    fs.link("/orig", "/alias").unwrap();
    assert_eq!(fs.stat("/orig").unwrap().nlink, 2);
    assert_eq!(fs.stat("/alias").unwrap().size, 12);

    fs.unlink("/alias").unwrap();
    fs.flush().unwrap();
    assert_eq!(fs.stat("/orig").unwrap().nlink, 1);
    let after = raw_counts(&disk.snapshot());
    assert_eq!(before.sb_free_blocks, after.sb_free_blocks);
    assert_eq!(before.sb_free_inodes, after.sb_free_inodes);

    let mut f = fs.open("/orig", OpenFlags::READ, 0).unwrap();
    let mut buf = [0u8; 16];
    let n = f.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hard link me");
    f.close().unwrap();
    fs.unmount().unwrap();
}

#[test]
fn rename_there_and_back_is_a_no_op() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);

    let mut f = fs
        .open("/a", OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();
    f.write(b"shuttle").unwrap();
    f.close().unwrap();
    fs.flush().unwrap();
    let before = raw_counts(&disk.snapshot());

    fs.rename("/a", "/b").unwrap();
    assert!(matches!(fs.stat("/a"), Err(Error::NotFound)));
    fs.rename("/b", "/a").unwrap();

    let after = raw_counts(&disk.snapshot());
    assert_eq!(before.sb_free_blocks, after.sb_free_blocks);
    assert_eq!(before.sb_free_inodes, after.sb_free_inodes);
    let mut f = fs.open("/a", OpenFlags::READ, 0).unwrap();
    let mut buf = [0u8; 16];
    let n = f.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"shuttle");
    f.close().unwrap();
    fs.unmount().unwrap();
}

#[test]
fn write_then_read_matches_at_arbitrary_offsets() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    let mut f = fs
        .open("/blob", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();

    // offsets chosen to straddle block boundaries in every combination
    for &(offset, len) in &[(0u64, 10usize), (1020, 8), (2048, 1024), (3000, 5000), (1023, 1)] {
        let payload: Vec<u8> = (0..len).map(|i| ((i + offset as usize) % 251) as u8).collect();
        f.llseek(offset as i64, SeekWhence::Set).unwrap();
        assert_eq!(f.write(&payload).unwrap(), len);
        f.llseek(offset as i64, SeekWhence::Set).unwrap();
        let mut back = vec![0u8; len];
        assert_eq!(f.read(&mut back).unwrap(), len);
        assert_eq!(back, payload);
    }
    f.close().unwrap();
    fs.unmount().unwrap();
}

#[test]
fn chunked_reads_equal_one_bulk_read() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    let payload: Vec<u8> = (0..10_000).map(|i| (i % 253) as u8).collect();
    let mut f = fs
        .open("/chunky", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();
    f.write(&payload).unwrap();

    f.llseek(0, SeekWhence::Set).unwrap();
    let mut bulk = vec![0u8; payload.len()];
    assert_eq!(f.read(&mut bulk).unwrap(), payload.len());

    f.llseek(0, SeekWhence::Set).unwrap();
    let mut chunked = Vec::new();
    let mut chunk = [0u8; 97]; // deliberately smaller than a block
    loop {
        let n = f.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        chunked.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(bulk, chunked);
    assert_eq!(bulk, payload);
    f.close().unwrap();
    fs.unmount().unwrap();
}

#[test]
fn sparse_holes_read_as_zeros() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    let mut f = fs
        .open("/sparse", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();

    f.llseek(100 * 1024, SeekWhence::Set).unwrap();
    f.write(b"end").unwrap();
    assert_eq!(f.fstat().size, 100 * 1024 + 3);

    f.llseek(0, SeekWhence::Set).unwrap();
    let mut buf = vec![0xAAu8; 4096];
    assert_eq!(f.read(&mut buf).unwrap(), 4096);
    assert!(buf.iter().all(|&b| b == 0));

    // the hole consumed no blocks beyond the written tail
    assert!(f.fstat().blocks * 512 < 10 * 1024);
    f.close().unwrap();
    fs.unmount().unwrap();
}

#[test]
fn chmod_round_trips_permission_bits() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    let mut f = fs
        .open("/perms", OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();
    f.chmod(0o4750).unwrap();
    assert_eq!(f.fstat().mode & 0o7777, 0o4750);
    assert_eq!(f.fstat().mode & 0xF000, 0x8000);
    f.chown(1000, 2000).unwrap();
    assert_eq!(f.fstat().uid, 1000);
    assert_eq!(f.fstat().gid, 2000);
    f.close().unwrap();

    assert_eq!(fs.stat("/perms").unwrap().mode & 0o7777, 0o4750);
    assert_eq!(fs.stat("/perms").unwrap().uid, 1000);
    fs.unmount().unwrap();
}

#[test]
fn trim_discards_free_space_once() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);

    disk.take_discards();
    fs.trim().unwrap();
    let first = disk.take_discards();
    assert!(!first.is_empty());
    let discarded: u64 = first.iter().map(|&(_, len)| len).sum();
    let free = u64::from(raw_counts(&disk.snapshot()).bitmap_free_blocks);
    assert_eq!(discarded, free * 1024);

    // immediately repeated, nothing is left to discard
    fs.trim().unwrap();
    assert!(disk.take_discards().is_empty());

    // allocation activity re-arms the pass
    fs.mkdir("/wake", 0o755).unwrap();
    fs.trim().unwrap();
    assert!(!disk.take_discards().is_empty());
    fs.unmount().unwrap();
}

#[test]
fn exclusive_create_refuses_existing_paths() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    fs.open("/x", OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap()
        .close()
        .unwrap();
    assert!(matches!(
        fs.open(
            "/x",
            OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::EXCL,
            0o644
        ),
        Err(Error::AlreadyExists)
    ));
    fs.unmount().unwrap();
}

#[test]
fn reading_past_the_end_returns_nothing() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    let mut f = fs
        .open("/short", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();
    f.write(b"abc").unwrap();
    f.llseek(1000, SeekWhence::Set).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(f.read(&mut buf).unwrap(), 0);
    f.close().unwrap();
    fs.unmount().unwrap();
}

#[test]
fn symlink_chains_are_bounded() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    fs.open("/base", OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap()
        .close()
        .unwrap();

    fs.symlink("/base", "/s1").unwrap();
    for i in 2..=41 {
        fs.symlink(&format!("/s{}", i - 1), &format!("/s{i}")).unwrap();
    }
    // forty hops resolve, forty-one do not
    assert!(fs.open("/s40", OpenFlags::READ, 0).is_ok());
    assert!(matches!(
        fs.open("/s41", OpenFlags::READ, 0),
        Err(Error::SymlinkLoop)
    ));

    fs.symlink("/tight", "/tight").unwrap();
    assert!(matches!(
        fs.open("/tight", OpenFlags::READ, 0),
        Err(Error::SymlinkLoop)
    ));
    fs.unmount().unwrap();
}

#[test]
fn rename_over_a_populated_directory_is_refused() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    fs.mkdir("/src", 0o755).unwrap();
    fs.mkdir("/dst", 0o755).unwrap();
    fs.open("/dst/occupant", OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap()
        .close()
        .unwrap();

    assert!(matches!(
        fs.rename("/src", "/dst"),
        Err(Error::NotEmpty)
    ));

    // an empty target directory is fair game
    fs.unlink("/dst/occupant").unwrap();
    fs.rename("/src", "/dst").unwrap();
    assert!(matches!(fs.stat("/src"), Err(Error::NotFound)));
    fs.unmount().unwrap();
}

#[test]
fn the_root_cannot_be_removed() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    assert!(fs.rmdir("/").is_err());
    fs.unmount().unwrap();
}

#[test]
fn truncation_zeroes_resurface_on_regrowth() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    let mut f = fs
        .open("/trunc", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();
    f.write(&vec![0xFFu8; 2000]).unwrap();
    f.set_size(500).unwrap();
    assert_eq!(f.fstat().size, 500);

    f.set_size(2000).unwrap();
    f.llseek(0, SeekWhence::Set).unwrap();
    let mut buf = vec![0u8; 2000];
    assert_eq!(f.read(&mut buf).unwrap(), 2000);
    assert!(buf[..500].iter().all(|&b| b == 0xFF));
    assert!(buf[500..].iter().all(|&b| b == 0));
    f.close().unwrap();
    fs.unmount().unwrap();
}

#[test]
fn truncate_on_open_empties_the_file() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = mount(&disk);
    let mut f = fs
        .open("/t", OpenFlags::WRITE | OpenFlags::CREAT, 0o644)
        .unwrap();
    f.write(&vec![1u8; 5000]).unwrap();
    f.close().unwrap();
    fs.flush().unwrap();

    fs.open("/t", OpenFlags::WRITE | OpenFlags::TRUNC, 0)
        .unwrap()
        .close()
        .unwrap();
    assert_eq!(fs.stat("/t").unwrap().size, 0);
    fs.flush().unwrap();
    assert_counts_consistent(&disk);
    fs.unmount().unwrap();
}

#[test]
fn a_remount_of_an_untouched_image_changes_nothing_observable() {
    let disk = fresh_disk(ImageSpec::ext4());
    let fs = Ext4::mount(
        disk.clone(),
        MountOptions {
            write: false,
            ..Default::default()
        },
    )
    .unwrap();
    let first = fs.readdir("/").unwrap();
    let stat1 = fs.stat("/").unwrap();
    fs.unmount().unwrap();
    let image_after_first = disk.snapshot();

    let fs = Ext4::mount(
        disk.clone(),
        MountOptions {
            write: false,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(fs.readdir("/").unwrap(), first);
    assert_eq!(fs.stat("/").unwrap(), stat1);
    fs.unmount().unwrap();
    assert_eq!(disk.snapshot(), image_after_first);
}
