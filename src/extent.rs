//! Extent-tree block mapping.
//!
//! Under the `EXTENTS` inode flag, `i_block` holds the root node of a B+-like
//! tree instead of the classic indirect map. Every node starts with an
//! [`ExtentHeader`]; interior nodes carry [`ExtentIdx`] records pointing at
//! child blocks, leaves carry [`Extent`] records each mapping a contiguous
//! run of logical blocks onto physical blocks. Leaf entries are kept in
//! strictly increasing `ee_block` order.
//!
//! The root lives inline in the inode (at most four entries); overflowing
//! nodes split at the midpoint and propagate upward, growing a new root when
//! the inline node itself runs out of slots.

use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};

use crate::error::{CanFail, Error, Ext4Result};
use crate::fs::Ext4Fs;
use crate::inode::{Inode, InodeFlags, InodeNo};
use crate::io::BlockDevice;
use crate::sb::crc32c_raw;

/// Magic number opening every extent node.
pub const EXTENT_MAGIC: u16 = 0xF30A;

/// Size of a node header and of each entry.
const ENTRY_SIZE: usize = 12;

/// Longest initialized extent, in blocks.
const MAX_EXTENT_LEN: u16 = 32768;

/// Deepest tree the engine will follow.
const MAX_DEPTH: u16 = 5;

/// Header of an extent-tree node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ExtentHeader {
    /// Must be [`EXTENT_MAGIC`].
    pub eh_magic: u16,
    /// Valid entries following the header.
    pub eh_entries: u16,
    /// Entry capacity of this node.
    pub eh_max: u16,
    /// 0 for leaves, distance to leaves otherwise.
    pub eh_depth: u16,
    /// Tree generation.
    pub eh_generation: u32,
}

const _: () = assert!(core::mem::size_of::<ExtentHeader>() == ENTRY_SIZE);

/// Leaf entry: maps `[ee_block, ee_block + len)` onto physical blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Extent {
    /// First logical block covered.
    pub ee_block: u32,
    /// Covered block count; above 32768 the extent is unwritten and covers
    /// `ee_len - 32768` blocks.
    pub ee_len: u16,
    /// Physical start, high 16 bits.
    pub ee_start_hi: u16,
    /// Physical start, low 32 bits.
    pub ee_start_lo: u32,
}

const _: () = assert!(core::mem::size_of::<Extent>() == ENTRY_SIZE);

impl Extent {
    /// First physical block.
    pub fn start(&self) -> u64 {
        u64::from(self.ee_start_lo) | (u64::from(self.ee_start_hi) << 32)
    }

    fn set_start(&mut self, blk: u64) {
        self.ee_start_lo = blk as u32;
        self.ee_start_hi = (blk >> 32) as u16;
    }

    /// Covered block count, unwritten or not.
    pub fn len(&self) -> u32 {
        if self.ee_len > MAX_EXTENT_LEN {
            u32::from(self.ee_len - MAX_EXTENT_LEN)
        } else {
            u32::from(self.ee_len)
        }
    }

    /// Whether `logical` falls inside this extent.
    pub fn contains(&self, logical: u32) -> bool {
        logical >= self.ee_block && u64::from(logical) < u64::from(self.ee_block) + u64::from(self.len())
    }
}

/// Interior entry: all blocks from `ei_block` on live under `leaf()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ExtentIdx {
    /// First logical block covered by the child.
    pub ei_block: u32,
    /// Child node block, low 32 bits.
    pub ei_leaf_lo: u32,
    /// Child node block, high 16 bits.
    pub ei_leaf_hi: u16,
    pub ei_unused: u16,
}

const _: () = assert!(core::mem::size_of::<ExtentIdx>() == ENTRY_SIZE);

impl ExtentIdx {
    /// Block number of the child node.
    pub fn leaf(&self) -> u64 {
        u64::from(self.ei_leaf_lo) | (u64::from(self.ei_leaf_hi) << 32)
    }

    fn set_leaf(&mut self, blk: u64) {
        self.ei_leaf_lo = blk as u32;
        self.ei_leaf_hi = (blk >> 32) as u16;
    }
}

/// Byte-buffer view of one tree node (the inline root or a whole block).
struct Node<'a> {
    buf: &'a mut [u8],
}

impl<'a> Node<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    fn header(&self) -> ExtentHeader {
        *from_bytes(&self.buf[..ENTRY_SIZE])
    }

    fn set_header(&mut self, header: ExtentHeader) {
        self.buf[..ENTRY_SIZE].copy_from_slice(bytes_of(&header));
    }

    fn checked_header(&self) -> Ext4Result<ExtentHeader> {
        let header = self.header();
        if header.eh_magic != EXTENT_MAGIC {
            return Err(Error::Corrupted("bad extent node magic"));
        }
        if header.eh_entries > header.eh_max || header.eh_depth > MAX_DEPTH {
            return Err(Error::Corrupted("malformed extent node"));
        }
        Ok(header)
    }

    fn entry_bytes(&self, i: u16) -> &[u8] {
        let off = ENTRY_SIZE * (1 + usize::from(i));
        &self.buf[off..off + ENTRY_SIZE]
    }

    fn extent(&self, i: u16) -> Extent {
        *from_bytes(self.entry_bytes(i))
    }

    fn idx(&self, i: u16) -> ExtentIdx {
        *from_bytes(self.entry_bytes(i))
    }

    fn set_entry(&mut self, i: u16, raw: &[u8; ENTRY_SIZE]) {
        let off = ENTRY_SIZE * (1 + usize::from(i));
        self.buf[off..off + ENTRY_SIZE].copy_from_slice(raw);
    }

    fn set_extent(&mut self, i: u16, e: Extent) {
        self.set_entry(i, bytes_of(&e).try_into().unwrap());
    }

    fn set_idx(&mut self, i: u16, x: ExtentIdx) {
        self.set_entry(i, bytes_of(&x).try_into().unwrap());
    }

    /// Shifts entries right and writes `raw` at position `i`. The caller has
    /// checked there is room.
    fn insert_entry(&mut self, i: u16, raw: &[u8; ENTRY_SIZE]) {
        let mut header = self.header();
        let start = ENTRY_SIZE * (1 + usize::from(i));
        let end = ENTRY_SIZE * (1 + usize::from(header.eh_entries));
        self.buf.copy_within(start..end, start + ENTRY_SIZE);
        self.set_entry(i, raw);
        header.eh_entries += 1;
        self.set_header(header);
    }

    /// Removes the entry at position `i`, shifting the tail left.
    fn remove_entry(&mut self, i: u16) {
        let mut header = self.header();
        let start = ENTRY_SIZE * (2 + usize::from(i));
        let end = ENTRY_SIZE * (1 + usize::from(header.eh_entries));
        self.buf.copy_within(start..end, start - ENTRY_SIZE);
        header.eh_entries -= 1;
        self.set_header(header);
    }

    /// Index of the last entry whose key is `<= logical`, if any.
    fn search(&self, logical: u32) -> Option<u16> {
        let header = self.header();
        let mut lo = 0u16;
        let mut hi = header.eh_entries;
        // keys are the first u32 of both entry kinds
        while lo < hi {
            let mid = (lo + hi) / 2;
            let key = u32::from_le_bytes(self.entry_bytes(mid)[..4].try_into().unwrap());
            if key <= logical {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }
}

/// Entry capacity of a block-sized node.
fn block_node_max<D: BlockDevice>(fs: &Ext4Fs<D>) -> u16 {
    let mut space = fs.sb.blk_size() as usize - ENTRY_SIZE;
    if fs.sb.metadata_csum() {
        space -= 4;
    }
    (space / ENTRY_SIZE) as u16
}

/// Entry capacity of the inline root.
fn root_max() -> u16 {
    ((60 - ENTRY_SIZE) / ENTRY_SIZE) as u16
}

fn node_csum(fs: &Ext4Fs<impl BlockDevice>, ino: InodeNo, gen: u32, buf: &[u8]) -> u32 {
    let mut crc = crc32c_raw(fs.sb.chksum_seed(), &ino.to_le_bytes());
    crc = crc32c_raw(crc, &gen.to_le_bytes());
    let header: ExtentHeader = *from_bytes(&buf[..ENTRY_SIZE]);
    let tail = ENTRY_SIZE * (1 + usize::from(header.eh_max));
    crc32c_raw(crc, &buf[..tail.min(buf.len())])
}

fn read_node<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    gen: u32,
    blk: u64,
) -> Ext4Result<Vec<u8>> {
    if blk == 0 || blk >= fs.sb.blk_count() {
        return Err(Error::Corrupted("extent node block out of range"));
    }
    let buf = fs.read_blk(blk)?;
    if fs.sb.metadata_csum() {
        let header: ExtentHeader = *from_bytes(&buf[..ENTRY_SIZE]);
        if header.eh_magic == EXTENT_MAGIC {
            let tail = ENTRY_SIZE * (1 + usize::from(header.eh_max));
            if tail + 4 <= buf.len() {
                let stored = u32::from_le_bytes(buf[tail..tail + 4].try_into().unwrap());
                let computed = node_csum(fs, ino, gen, &buf);
                if stored != computed {
                    log::error!("inode {ino}: extent block {blk} checksum mismatch");
                }
            }
        }
    }
    Ok(buf)
}

fn write_node<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    gen: u32,
    blk: u64,
    buf: &mut [u8],
) -> CanFail {
    if fs.sb.metadata_csum() {
        let header: ExtentHeader = *from_bytes(&buf[..ENTRY_SIZE]);
        let tail = ENTRY_SIZE * (1 + usize::from(header.eh_max));
        if tail + 4 <= buf.len() {
            let csum = node_csum(fs, ino, gen, buf);
            buf[tail..tail + 4].copy_from_slice(&csum.to_le_bytes());
        }
    }
    fs.write_blk(blk, buf)
}

/// Seeds an empty extent tree in `i_block` and sets the flag.
pub fn extent_init(inode: &mut Inode) {
    inode.i_flags.insert(InodeFlags::EXTENTS);
    let mut root = [0u8; 60];
    let header = ExtentHeader {
        eh_magic: EXTENT_MAGIC,
        eh_entries: 0,
        eh_max: root_max(),
        eh_depth: 0,
        eh_generation: 0,
    };
    root[..ENTRY_SIZE].copy_from_slice(bytes_of(&header));
    inode.set_block_bytes(&root);
}

/// Translates `logical` without allocating. `Ok(None)` is a hole.
pub fn extent_lookup<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    inode: &Inode,
    logical: u32,
) -> Ext4Result<Option<u64>> {
    let mut root = inode.block_bytes();
    let mut node_buf: Vec<u8>;
    let mut node = Node::new(&mut root[..]);
    loop {
        let header = node.checked_header()?;
        if header.eh_depth == 0 {
            let Some(i) = node.search(logical) else {
                return Ok(None);
            };
            let extent = node.extent(i);
            if !extent.contains(logical) {
                return Ok(None);
            }
            return Ok(Some(extent.start() + u64::from(logical - extent.ee_block)));
        }
        let Some(i) = node.search(logical) else {
            return Ok(None);
        };
        let child = node.idx(i).leaf();
        node_buf = read_node(fs, ino, inode.i_generation, child)?;
        node = Node::new(&mut node_buf[..]);
    }
}

/// One step of the descent taken by [`extent_map`].
struct PathLevel {
    /// Backing block; `None` for the inline root.
    blk: Option<u64>,
    buf: Vec<u8>,
    /// Entry the descent followed.
    child: u16,
}

/// Outcome of inserting into a node.
enum Insert {
    Done,
    /// The node split; link `(key, block)` into the parent.
    Split { key: u32, block: u64 },
}

/// Translates `logical`, allocating and linking a physical block (and any
/// missing tree blocks) when the mapping does not exist yet.
pub fn extent_map<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    inode: &mut Inode,
    logical: u32,
) -> Ext4Result<u64> {
    if let Some(phys) = extent_lookup(fs, ino, inode, logical)? {
        return Ok(phys);
    }

    // Walk down, remembering the path for the upward split pass.
    let mut path: Vec<PathLevel> = Vec::new();
    let mut cur_buf = inode.block_bytes().to_vec();
    let mut cur_blk: Option<u64> = None;
    loop {
        let step = {
            let node = Node::new(&mut cur_buf[..]);
            let header = node.checked_header()?;
            if header.eh_depth == 0 {
                None
            } else {
                let i = node.search(logical).unwrap_or(0);
                Some((i, node.idx(i).leaf()))
            }
        };
        let Some((i, child_blk)) = step else {
            break;
        };
        path.push(PathLevel {
            blk: cur_blk,
            buf: core::mem::take(&mut cur_buf),
            child: i,
        });
        cur_buf = read_node(fs, ino, inode.i_generation, child_blk)?;
        cur_blk = Some(child_blk);
    }
    let mut leaf_level = PathLevel {
        blk: cur_blk,
        buf: cur_buf,
        child: 0,
    };

    // Pick the new physical block, preferring contiguity with the
    // predecessor extent.
    let goal = {
        let node = Node::new(&mut leaf_level.buf[..]);
        match node.search(logical) {
            Some(i) => node.extent(i).start() + u64::from(node.extent(i).len()),
            None => fs.inode_goal(ino),
        }
    };
    let physical = fs.alloc_block(goal)?;
    inode.adjust_blocks(&fs.sb, 1);

    let outcome = leaf_insert(fs, ino, inode, &mut leaf_level, logical, physical)?;
    propagate(fs, ino, inode, path, leaf_level, outcome, logical)?;
    Ok(physical)
}

/// Inserts `(logical -> physical)` into the leaf, splitting when full.
fn leaf_insert<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    inode: &mut Inode,
    level: &mut PathLevel,
    logical: u32,
    physical: u64,
) -> Ext4Result<Insert> {
    let mut node = Node::new(&mut level.buf[..]);
    let header = node.header();

    // Contiguity merge with the predecessor.
    if let Some(i) = node.search(logical) {
        let mut prev = node.extent(i);
        if prev.ee_len < MAX_EXTENT_LEN
            && u64::from(prev.ee_block) + u64::from(prev.len()) == u64::from(logical)
            && prev.start() + u64::from(prev.len()) == physical
        {
            prev.ee_len += 1;
            node.set_extent(i, prev);
            return Ok(Insert::Done);
        }
    }

    let mut new = Extent {
        ee_block: logical,
        ee_len: 1,
        ..Default::default()
    };
    new.set_start(physical);
    let pos = node.search(logical).map_or(0, |i| i + 1);

    if header.eh_entries < header.eh_max {
        node.insert_entry(pos, bytes_of(&new).try_into().unwrap());
        return Ok(Insert::Done);
    }

    // Full leaf: split at the midpoint into a fresh block.
    let split_at = header.eh_entries / 2;
    let new_blk = fs.alloc_block(fs.inode_goal(ino))?;
    inode.adjust_blocks(&fs.sb, 1);
    let mut right_buf = fs.io.allocate_blk();
    {
        let mut right = Node::new(&mut right_buf[..]);
        right.set_header(ExtentHeader {
            eh_magic: EXTENT_MAGIC,
            eh_entries: 0,
            eh_max: block_node_max(fs),
            eh_depth: 0,
            eh_generation: 0,
        });
        for (dst, src) in (split_at..header.eh_entries).enumerate() {
            let raw: [u8; ENTRY_SIZE] = node.entry_bytes(src).try_into().unwrap();
            right.insert_entry(dst as u16, &raw);
        }
        let mut left_header = node.header();
        left_header.eh_entries = split_at;
        node.set_header(left_header);

        let split_key = right.extent(0).ee_block;
        if logical < split_key {
            let pos = node.search(logical).map_or(0, |i| i + 1);
            node.insert_entry(pos, bytes_of(&new).try_into().unwrap());
        } else {
            let pos = right.search(logical).map_or(0, |i| i + 1);
            right.insert_entry(pos, bytes_of(&new).try_into().unwrap());
        }
    }
    write_node(fs, ino, inode.i_generation, new_blk, &mut right_buf)?;
    let key = {
        let right = Node::new(&mut right_buf[..]);
        right.extent(0).ee_block
    };
    Ok(Insert::Split {
        key,
        block: new_blk,
    })
}

/// Writes the modified levels back, inserting split links upward and growing
/// the root when the inline node overflows.
fn propagate<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    inode: &mut Inode,
    mut path: Vec<PathLevel>,
    mut child_level: PathLevel,
    mut outcome: Insert,
    logical: u32,
) -> CanFail {
    loop {
        // Persist the modified child level.
        match child_level.blk {
            Some(blk) => write_node(fs, ino, inode.i_generation, blk, &mut child_level.buf)?,
            None => {
                // Inline root.
                let mut root = [0u8; 60];
                root.copy_from_slice(&child_level.buf[..60]);
                if let Insert::Split { key, block } = outcome {
                    // The inline root has no parent to take the link: grow
                    // the tree by moving the root payload into a new block.
                    grow_root(fs, ino, inode, &mut root, key, block)?;
                }
                inode.set_block_bytes(&root);
                return Ok(());
            }
        }

        let Some(mut parent) = path.pop() else {
            // Child was block-backed and the root has already been walked.
            match outcome {
                Insert::Done => return Ok(()),
                Insert::Split { .. } => {
                    return Err(Error::Corrupted("extent split escaped the root"))
                }
            }
        };

        // An insert below every existing key must lower the index key of the
        // followed child, or lookups would miss the new mapping.
        {
            let mut node = Node::new(&mut parent.buf[..]);
            let mut followed = node.idx(parent.child);
            if followed.ei_block > logical {
                followed.ei_block = logical;
                node.set_idx(parent.child, followed);
            }
        }

        outcome = match outcome {
            Insert::Done => Insert::Done,
            Insert::Split { key, block } => {
                let mut node = Node::new(&mut parent.buf[..]);
                let header = node.header();
                let mut link = ExtentIdx {
                    ei_block: key,
                    ..Default::default()
                };
                link.set_leaf(block);
                if header.eh_entries < header.eh_max {
                    node.insert_entry(parent.child + 1, bytes_of(&link).try_into().unwrap());
                    Insert::Done
                } else {
                    // Split this index node as well.
                    let split_at = header.eh_entries / 2;
                    let new_blk = fs.alloc_block(fs.inode_goal(ino))?;
                    inode.adjust_blocks(&fs.sb, 1);
                    let mut right_buf = fs.io.allocate_blk();
                    {
                        let mut right = Node::new(&mut right_buf[..]);
                        right.set_header(ExtentHeader {
                            eh_magic: EXTENT_MAGIC,
                            eh_entries: 0,
                            eh_max: block_node_max(fs),
                            eh_depth: header.eh_depth,
                            eh_generation: 0,
                        });
                        for (dst, src) in (split_at..header.eh_entries).enumerate() {
                            let raw: [u8; ENTRY_SIZE] = node.entry_bytes(src).try_into().unwrap();
                            right.insert_entry(dst as u16, &raw);
                        }
                        let mut left_header = node.header();
                        left_header.eh_entries = split_at;
                        node.set_header(left_header);

                        let split_key = right.idx(0).ei_block;
                        if key < split_key {
                            let pos = node.search(key).map_or(0, |i| i + 1);
                            node.insert_entry(pos, bytes_of(&link).try_into().unwrap());
                        } else {
                            let pos = right.search(key).map_or(0, |i| i + 1);
                            right.insert_entry(pos, bytes_of(&link).try_into().unwrap());
                        }
                    }
                    write_node(fs, ino, inode.i_generation, new_blk, &mut right_buf)?;
                    let right = Node::new(&mut right_buf[..]);
                    Insert::Split {
                        key: right.idx(0).ei_block,
                        block: new_blk,
                    }
                }
            }
        };
        child_level = parent;
    }
}

/// Moves the inline root's payload into a fresh block and relinks the root
/// as a one-entry (plus the pending split link) index node a level higher.
fn grow_root<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    inode: &mut Inode,
    root: &mut [u8; 60],
    pending_key: u32,
    pending_block: u64,
) -> CanFail {
    let old_header: ExtentHeader = *from_bytes(&root[..ENTRY_SIZE]);
    if old_header.eh_depth + 1 > MAX_DEPTH {
        return Err(Error::FileTooBig);
    }

    let copy_blk = fs.alloc_block(fs.inode_goal(ino))?;
    inode.adjust_blocks(&fs.sb, 1);
    let mut copy_buf = fs.io.allocate_blk();
    copy_buf[..60].copy_from_slice(&root[..]);
    {
        let mut copy = Node::new(&mut copy_buf[..]);
        let mut header = copy.header();
        header.eh_max = block_node_max(fs);
        copy.set_header(header);
    }
    write_node(fs, ino, inode.i_generation, copy_blk, &mut copy_buf)?;

    let first_key = u32::from_le_bytes(root[ENTRY_SIZE..ENTRY_SIZE + 4].try_into().unwrap());
    root.fill(0);
    let mut node = Node::new(&mut root[..]);
    node.set_header(ExtentHeader {
        eh_magic: EXTENT_MAGIC,
        eh_entries: 0,
        eh_max: root_max(),
        eh_depth: old_header.eh_depth + 1,
        eh_generation: 0,
    });
    let mut left = ExtentIdx {
        ei_block: if old_header.eh_entries > 0 { first_key } else { 0 },
        ..Default::default()
    };
    left.set_leaf(copy_blk);
    node.insert_entry(0, bytes_of(&left).try_into().unwrap());
    let mut right = ExtentIdx {
        ei_block: pending_key,
        ..Default::default()
    };
    right.set_leaf(pending_block);
    node.insert_entry(1, bytes_of(&right).try_into().unwrap());
    Ok(())
}

/// Frees every data block mapped in `[start, end]` and trims the tree.
///
/// Returns the number of data blocks released. The root header stays in
/// `i_block` even when the file ends up empty.
pub fn extent_punch<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    inode: &mut Inode,
    start: u32,
    end: u32,
) -> Ext4Result<u64> {
    let end = end.min(u32::MAX - 1);
    let mut root = inode.block_bytes();
    let mut freed = 0u64;
    let mut tree_blocks = 0u64;
    punch_node(
        fs,
        ino,
        inode.i_generation,
        &mut root[..],
        None,
        start,
        end,
        &mut freed,
        &mut tree_blocks,
    )?;
    inode.set_block_bytes(&root);
    inode.adjust_blocks(&fs.sb, -((freed + tree_blocks) as i64));
    Ok(freed)
}

/// Recursive worker for [`extent_punch`]; returns whether the node is empty.
#[allow(clippy::too_many_arguments)]
fn punch_node<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    gen: u32,
    buf: &mut [u8],
    blk: Option<u64>,
    start: u32,
    end: u32,
    freed: &mut u64,
    tree_blocks: &mut u64,
) -> Ext4Result<bool> {
    let mut node = Node::new(buf);
    let header = node.checked_header()?;

    if header.eh_depth == 0 {
        let mut i = 0u16;
        while i < node.header().eh_entries {
            let extent = node.extent(i);
            if extent.len() == 0 {
                return Err(Error::Corrupted("zero-length extent"));
            }
            let e_start = extent.ee_block;
            let e_end = e_start + extent.len() - 1;
            if e_end < start || e_start > end {
                i += 1;
                continue;
            }
            let cut_lo = start.max(e_start);
            let cut_hi = end.min(e_end);
            let cut_len = u64::from(cut_hi - cut_lo + 1);
            fs.free_blocks(extent.start() + u64::from(cut_lo - e_start), cut_len)?;
            *freed += cut_len;

            if cut_lo == e_start && cut_hi == e_end {
                node.remove_entry(i);
                continue;
            } else if cut_lo == e_start {
                let mut rest = extent;
                rest.ee_block = cut_hi + 1;
                rest.set_start(extent.start() + u64::from(cut_hi + 1 - e_start));
                rest.ee_len = extent.ee_len - cut_len as u16;
                node.set_extent(i, rest);
            } else if cut_hi == e_end {
                let mut head = extent;
                head.ee_len = extent.ee_len - cut_len as u16;
                node.set_extent(i, head);
            } else {
                // A hole in the middle leaves two pieces.
                let mut head = extent;
                head.ee_len = (cut_lo - e_start) as u16;
                node.set_extent(i, head);
                let mut tail = extent;
                tail.ee_block = cut_hi + 1;
                tail.set_start(extent.start() + u64::from(cut_hi + 1 - e_start));
                tail.ee_len = (e_end - cut_hi) as u16;
                if node.header().eh_entries >= node.header().eh_max {
                    return Err(Error::NoSpace);
                }
                node.insert_entry(i + 1, bytes_of(&tail).try_into().unwrap());
            }
            i += 1;
        }
    } else {
        let mut i = 0u16;
        while i < node.header().eh_entries {
            let idx = node.idx(i);
            let child_start = idx.ei_block;
            let child_end = if i + 1 < node.header().eh_entries {
                node.idx(i + 1).ei_block.saturating_sub(1)
            } else {
                u32::MAX
            };
            if child_end < start || child_start > end {
                i += 1;
                continue;
            }
            let child_blk = idx.leaf();
            let mut child_buf = read_node(fs, ino, gen, child_blk)?;
            let empty = punch_node(
                fs,
                ino,
                gen,
                &mut child_buf[..],
                Some(child_blk),
                start,
                end,
                freed,
                tree_blocks,
            )?;
            if empty {
                fs.free_blocks(child_blk, 1)?;
                *tree_blocks += 1;
                node.remove_entry(i);
            } else {
                write_node(fs, ino, gen, child_blk, &mut child_buf)?;
                i += 1;
            }
        }
    }

    let empty = node.header().eh_entries == 0;
    if let Some(blk) = blk {
        if !empty {
            write_node(fs, ino, gen, blk, node.buf)?;
        }
    }
    Ok(empty && blk.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(entries: &[(u32, u16, u64)]) -> [u8; 60] {
        let mut buf = [0u8; 60];
        let mut node = Node::new(&mut buf[..]);
        node.set_header(ExtentHeader {
            eh_magic: EXTENT_MAGIC,
            eh_entries: 0,
            eh_max: 4,
            eh_depth: 0,
            eh_generation: 0,
        });
        for (i, &(block, len, start)) in entries.iter().enumerate() {
            let mut e = Extent {
                ee_block: block,
                ee_len: len,
                ..Default::default()
            };
            e.set_start(start);
            node.insert_entry(i as u16, bytes_of(&e).try_into().unwrap());
        }
        buf
    }

    #[test]
    fn search_finds_the_covering_entry() {
        let mut buf = leaf_with(&[(0, 4, 100), (8, 2, 200), (16, 1, 300)]);
        let node = Node::new(&mut buf[..]);
        assert_eq!(node.search(0), Some(0));
        assert_eq!(node.search(3), Some(0));
        assert_eq!(node.search(7), Some(0));
        assert_eq!(node.search(9), Some(1));
        assert_eq!(node.search(100), Some(2));

        assert!(node.extent(0).contains(3));
        assert!(!node.extent(0).contains(4));
        assert!(node.extent(1).contains(9));
        assert!(!node.extent(1).contains(10));
    }

    #[test]
    fn insert_and_remove_keep_order() {
        let mut buf = leaf_with(&[(0, 1, 100), (10, 1, 200)]);
        let mut node = Node::new(&mut buf[..]);
        let mut e = Extent {
            ee_block: 5,
            ee_len: 1,
            ..Default::default()
        };
        e.set_start(150);
        node.insert_entry(1, bytes_of(&e).try_into().unwrap());
        assert_eq!(node.header().eh_entries, 3);
        assert_eq!(node.extent(0).ee_block, 0);
        assert_eq!(node.extent(1).ee_block, 5);
        assert_eq!(node.extent(2).ee_block, 10);

        node.remove_entry(0);
        assert_eq!(node.header().eh_entries, 2);
        assert_eq!(node.extent(0).ee_block, 5);
        assert_eq!(node.extent(1).ee_block, 10);
    }

    #[test]
    fn init_seeds_a_valid_empty_root() {
        let mut inode = Inode::zeroed();
        extent_init(&mut inode);
        assert!(inode.uses_extents());
        let mut root = inode.block_bytes();
        let node = Node::new(&mut root[..]);
        let header = node.checked_header().unwrap();
        assert_eq!(header.eh_entries, 0);
        assert_eq!(header.eh_max, 4);
        assert_eq!(header.eh_depth, 0);
    }

    #[test]
    fn unwritten_extent_lengths_decode() {
        let e = Extent {
            ee_block: 0,
            ee_len: 32768 + 7,
            ..Default::default()
        };
        assert_eq!(e.len(), 7);
        assert!(e.contains(6));
        assert!(!e.contains(7));
    }
}
