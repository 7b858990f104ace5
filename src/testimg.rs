//! Synthetic NTFS volume for the unit tests.
//!
//! 512-byte clusters, 1024-byte MFT entries, 128 clusters in total. The
//! `$MFT` stream is assembled unsealed and only receives its update
//! sequences in [`ImageBuilder::finish`], so tests can tweak entries first.

use std::io::Cursor;

pub const CLUSTER_SIZE: u64 = 512;
pub const RECORD_SIZE: usize = 1024;
pub const TOTAL_CLUSTERS: u64 = 128;

pub const MFT_CLUSTER: u64 = 4;
pub const MFT_RECORDS: u64 = 32;
pub const MFT_CLUSTERS: u64 = MFT_RECORDS * RECORD_SIZE as u64 / CLUSTER_SIZE;
pub const BITMAP_CLUSTER: u64 = 68;
pub const PLAIN_DATA_CLUSTER: u64 = 70;
pub const SUBDIR_INDEX_CLUSTER: u64 = 72;
pub const SPLIT_FIRST_CLUSTER: u64 = 76;
pub const SPLIT_SECOND_CLUSTER: u64 = 80;
pub const SPARSE_FIRST_CLUSTER: u64 = 84;
pub const SPARSE_LAST_CLUSTER: u64 = 86;
pub const COMPRESSED_CLUSTER: u64 = 88;
pub const FREE_CLUSTER: u64 = 100;

pub const FILE_PLAIN: u64 = 16;
pub const FILE_RESIDENT: u64 = 17;
pub const SUBDIR: u64 = 18;
pub const SUBDIR_LIVE: u64 = 19;
pub const FILE_SPLIT: u64 = 20;
pub const FILE_SPLIT_EXT: u64 = 21;
pub const FILE_STALE_LIST: u64 = 22;
pub const FILE_SPARSE: u64 = 23;
pub const FILE_COMPRESSED: u64 = 24;
pub const FILE_ORPHAN: u64 = 25;
pub const SUBDIR_DELETED: u64 = 26;
pub const SUBDIR_SECOND: u64 = 27;
/// Only present after [`ImageBuilder::add_looping_dir`].
pub const LOOP_DIR: u64 = 28;
/// Only present after [`ImageBuilder::add_twin_streams`].
pub const TWIN_STREAMS: u64 = 29;

/// Entry that straddles the two `$MFT` runs of [`split_mft_image`].
pub const SPLIT_RECORD: u64 = 16;

pub const PLAIN_SIZE: u64 = 700;
pub const SPLIT_CLUSTERS: u64 = 4;
pub const SPLIT_SIZE: u64 = SPLIT_CLUSTERS * CLUSTER_SIZE - 100;
pub const RESIDENT_CONTENT: &[u8] = b"resident file content\n";
pub const SUBDIR_LIVE_NAME: &str = "inner.txt";
pub const SUBDIR_DELETED_NAME: &str = "old.txt";
pub const SUBDIR_SECOND_NAME: &str = "second.txt";
pub const LOOP_DIR_NAME: &str = "loop";

const ROOT_SEQ: u16 = 5;
const SUBDIR_SEQ: u16 = 1;
// 2020-01-01T00:00:00Z
const T2020: u64 = 132_223_104_000_000_000;

const ATTR_SI: u32 = 0x10;
const ATTR_LIST: u32 = 0x20;
const ATTR_FN: u32 = 0x30;
const ATTR_OBJECT_ID: u32 = 0x40;
const ATTR_VOLINFO: u32 = 0x70;
const ATTR_DATA: u32 = 0x80;
const ATTR_IDXROOT: u32 = 0x90;
const ATTR_IDXALLOC: u32 = 0xA0;

const FLAG_IN_USE: u16 = 0x01;
const FLAG_DIR: u16 = 0x02;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn utf16(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_ref(buf: &mut [u8], off: usize, inum: u64, seq: u16) {
    buf[off..off + 6].copy_from_slice(&inum.to_le_bytes()[..6]);
    put_u16(buf, off + 6, seq);
}

/// Burn update sequence `usn` into every 512-byte sector of `buf`.
fn seal(buf: &mut [u8], usa_off: usize, usn: u16) {
    let sectors = buf.len() / 512;
    put_u16(buf, usa_off, usn);
    for i in 1..=sectors {
        let tail = i * 512 - 2;
        let saved = [buf[tail], buf[tail + 1]];
        buf[usa_off + 2 * i..usa_off + 2 * i + 2].copy_from_slice(&saved);
        put_u16(buf, tail, usn);
    }
}

/// Smallest little-endian width holding `v` as a signed value.
fn signed_width(v: i64) -> usize {
    (1..=8)
        .find(|n| {
            let shift = 64 - 8 * n;
            shift == 0 || (v << shift) >> shift == v
        })
        .unwrap_or(8)
}

/// Encode runs given as `(length, Some(cluster))` or `(length, None)` for
/// a hole.
pub fn encode_runs(runs: &[(u64, Option<u64>)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0i64;
    for (len, addr) in runs {
        let len_width = (1..=8).find(|n| *n == 8 || *len < 1u64 << (8 * n)).unwrap_or(8);
        match addr {
            Some(a) => {
                let delta = *a as i64 - prev;
                prev = *a as i64;
                let ofs_width = signed_width(delta);
                out.push(((ofs_width as u8) << 4) | len_width as u8);
                out.extend_from_slice(&len.to_le_bytes()[..len_width]);
                out.extend_from_slice(&delta.to_le_bytes()[..ofs_width]);
            }
            None => {
                out.push(len_width as u8);
                out.extend_from_slice(&len.to_le_bytes()[..len_width]);
            }
        }
    }
    out.push(0);
    out
}

pub fn standard_si(dos_flags: u32) -> Vec<u8> {
    let mut v = vec![0u8; 72];
    for i in 0..4 {
        put_u64(&mut v, 8 * i, T2020 + i as u64 * 10_000_000);
    }
    put_u32(&mut v, 32, dos_flags);
    put_u32(&mut v, 48, 1000);
    put_u32(&mut v, 52, 0x100);
    v
}

pub fn file_name(parent: u64, parent_seq: u16, name: &str, namespace: u8, is_dir: bool, real: u64) -> Vec<u8> {
    let encoded = utf16(name);
    let mut v = vec![0u8; 66];
    put_ref(&mut v, 0, parent, parent_seq);
    for i in 0..4 {
        put_u64(&mut v, 8 + 8 * i, T2020);
    }
    put_u64(&mut v, 40, align8(real as usize) as u64);
    put_u64(&mut v, 48, real);
    put_u64(&mut v, 56, if is_dir { 0x1000_0000 } else { 0x20 });
    v[64] = name.encode_utf16().count() as u8;
    v[65] = namespace;
    v.extend_from_slice(&encoded);
    v
}

/// Index entry keyed by a `$FILE_NAME`; returns its bytes.
fn index_entry(inum: u64, seq: u16, fname: &[u8]) -> Vec<u8> {
    let len = align8(16 + fname.len());
    let mut e = vec![0u8; len];
    put_ref(&mut e, 0, inum, seq);
    put_u16(&mut e, 8, len as u16);
    put_u16(&mut e, 10, fname.len() as u16);
    e[16..16 + fname.len()].copy_from_slice(fname);
    e
}

/// Terminating index entry, with a child VCN when `child` is set.
fn end_entry(child: Option<u64>) -> Vec<u8> {
    let len = if child.is_some() { 24 } else { 16 };
    let mut e = vec![0u8; len];
    put_u16(&mut e, 8, len as u16);
    put_u32(&mut e, 12, 0x02 | if child.is_some() { 0x01 } else { 0 });
    if let Some(vcn) = child {
        put_u64(&mut e, 16, vcn);
    }
    e
}

pub fn index_entry_len(name: &str) -> usize {
    align8(16 + 66 + 2 * name.encode_utf16().count())
}

/// Write an index entry for a file named `name` in the root directory at
/// `buf[off..]`; returns its length.
pub fn put_index_entry(buf: &mut [u8], off: usize, inum: u64, name: &str, dos: bool) -> usize {
    let fname = file_name(5, ROOT_SEQ, name, if dos { 2 } else { 1 }, false, 10);
    let e = index_entry(inum, 1, &fname);
    buf[off..off + e.len()].copy_from_slice(&e);
    e.len()
}

fn index_root(entries: &[Vec<u8>], has_children: bool) -> Vec<u8> {
    let body: Vec<u8> = entries.concat();
    let mut v = vec![0u8; 32];
    put_u32(&mut v, 0, ATTR_FN);
    put_u32(&mut v, 4, 1);
    put_u32(&mut v, 8, RECORD_SIZE as u32);
    v[12] = 2;
    let list_len = 16 + body.len();
    put_u32(&mut v, 16, 16);
    put_u32(&mut v, 20, list_len as u32);
    put_u32(&mut v, 24, list_len as u32);
    put_u32(&mut v, 28, has_children as u32);
    v.extend_from_slice(&body);
    v
}

/// One sealed `INDX` node of `RECORD_SIZE` bytes. `slack` is written
/// after the end entry, outside the node's in-use range.
fn index_node(vcn: u64, live: &[Vec<u8>], slack: &[Vec<u8>]) -> Vec<u8> {
    let mut node = vec![0u8; RECORD_SIZE];
    node[0..4].copy_from_slice(b"INDX");
    put_u16(&mut node, 4, 0x28);
    put_u16(&mut node, 6, (RECORD_SIZE / 512 + 1) as u16);
    put_u64(&mut node, 16, vcn);

    let mut off = 0x40;
    for e in live.iter().chain(std::iter::once(&end_entry(None))) {
        node[off..off + e.len()].copy_from_slice(e);
        off += e.len();
    }
    let in_use = off - 0x18;
    for e in slack {
        node[off..off + e.len()].copy_from_slice(e);
        off += e.len();
    }
    put_u32(&mut node, 0x18, (0x40 - 0x18) as u32);
    put_u32(&mut node, 0x1C, in_use as u32);
    put_u32(&mut node, 0x20, (RECORD_SIZE - 0x18) as u32);
    seal(&mut node, 0x28, 0x0007);
    node
}

/// One MFT entry under construction.
struct Record {
    buf: Vec<u8>,
    off: usize,
    next_id: u16,
}

impl Record {
    fn new(seq: u16, flags: u16, base: u64) -> Self {
        let mut buf = vec![0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(b"FILE");
        put_u16(&mut buf, 4, 0x30);
        put_u16(&mut buf, 6, (RECORD_SIZE / 512 + 1) as u16);
        put_u16(&mut buf, 16, seq);
        put_u16(&mut buf, 18, 1);
        put_u16(&mut buf, 20, 0x38);
        put_u16(&mut buf, 22, flags);
        put_u32(&mut buf, 28, RECORD_SIZE as u32);
        put_ref(&mut buf, 32, base, if base == 0 { 0 } else { 1 });
        Self {
            buf,
            off: 0x38,
            next_id: 0,
        }
    }

    fn take_id(&mut self, id: Option<u16>) -> u16 {
        let id = id.unwrap_or(self.next_id);
        self.next_id = self.next_id.max(id + 1);
        id
    }

    fn resident(&mut self, ty: u32, id: Option<u16>, name: &str, value: &[u8]) -> u16 {
        let id = self.take_id(id);
        let name = utf16(name);
        let value_off = align8(0x18 + name.len());
        let len = align8(value_off + value.len());
        let a = &mut self.buf[self.off..self.off + len];
        put_u32(a, 0, ty);
        put_u32(a, 4, len as u32);
        a[9] = (name.len() / 2) as u8;
        put_u16(a, 10, 0x18);
        put_u16(a, 14, id);
        put_u32(a, 16, value.len() as u32);
        put_u16(a, 20, value_off as u16);
        a[0x18..0x18 + name.len()].copy_from_slice(&name);
        a[value_off..value_off + value.len()].copy_from_slice(value);
        self.off += len;
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn non_resident(
        &mut self,
        ty: u32,
        id: Option<u16>,
        name: &str,
        start_vcn: u64,
        runs: &[(u64, Option<u64>)],
        real: u64,
        flags: u16,
    ) -> u16 {
        let id = self.take_id(id);
        let name = utf16(name);
        let run_bytes = encode_runs(runs);
        let clusters: u64 = runs.iter().map(|r| r.0).sum();
        let run_off = align8(0x40 + name.len());
        let len = align8(run_off + run_bytes.len());
        let a = &mut self.buf[self.off..self.off + len];
        put_u32(a, 0, ty);
        put_u32(a, 4, len as u32);
        a[8] = 1;
        a[9] = (name.len() / 2) as u8;
        put_u16(a, 10, 0x40);
        put_u16(a, 12, flags);
        put_u16(a, 14, id);
        put_u64(a, 16, start_vcn);
        put_u64(a, 24, start_vcn + clusters - 1);
        put_u16(a, 32, run_off as u16);
        if flags & 0x0001 != 0 {
            put_u16(a, 34, 4);
        }
        put_u64(a, 40, clusters * CLUSTER_SIZE);
        put_u64(a, 48, real);
        put_u64(a, 56, real);
        a[0x40..0x40 + name.len()].copy_from_slice(&name);
        a[run_off..run_off + run_bytes.len()].copy_from_slice(&run_bytes);
        self.off += len;
        id
    }

    fn close(mut self) -> Vec<u8> {
        put_u32(&mut self.buf, self.off, 0xFFFF_FFFF);
        put_u32(&mut self.buf, 24, (self.off + 8) as u32);
        put_u16(&mut self.buf, 40, self.next_id);
        self.buf
    }
}

fn list_entry(ty: u32, start_vcn: u64, inum: u64, id: u16) -> Vec<u8> {
    let mut e = vec![0u8; 32];
    put_u32(&mut e, 0, ty);
    put_u16(&mut e, 4, 32);
    e[7] = 26;
    put_u64(&mut e, 8, start_vcn);
    put_ref(&mut e, 16, inum, 1);
    put_u16(&mut e, 24, id);
    e
}

pub fn plain_content() -> Vec<u8> {
    (0..PLAIN_SIZE).map(|i| (i * 7 % 251) as u8).collect()
}

pub struct ImageBuilder {
    img: Vec<u8>,
    mft: Vec<u8>,
    mft_runs: Vec<(u64, u64)>,
    allocated: Vec<u64>,
    corrupt_tails: Vec<u64>,
}

impl ImageBuilder {
    pub fn standard() -> Self {
        Self::new(vec![(MFT_CLUSTER, MFT_CLUSTERS)], "plain.txt")
    }

    fn new(mft_runs: Vec<(u64, u64)>, plain_name: &str) -> Self {
        let mut b = Self {
            img: vec![0u8; (TOTAL_CLUSTERS * CLUSTER_SIZE) as usize],
            mft: vec![0u8; MFT_RECORDS as usize * RECORD_SIZE],
            allocated: vec![0, BITMAP_CLUSTER],
            mft_runs,
            corrupt_tails: Vec::new(),
        };
        for (addr, len) in b.mft_runs.clone() {
            b.allocated.extend(addr..addr + len);
        }
        b.system_records();
        b.files(plain_name);
        b
    }

    fn put_record(&mut self, inum: u64, rec: Record) {
        let off = inum as usize * RECORD_SIZE;
        self.mft[off..off + RECORD_SIZE].copy_from_slice(&rec.close());
    }

    fn write_cluster(&mut self, addr: u64, bytes: &[u8]) {
        let off = (addr * CLUSTER_SIZE) as usize;
        self.img[off..off + bytes.len()].copy_from_slice(bytes);
        let clusters = (bytes.len() as u64).div_ceil(CLUSTER_SIZE);
        self.allocated.extend(addr..addr + clusters);
    }

    fn system_file(&mut self, inum: u64, name: &str, dir: bool) -> Record {
        let flags = FLAG_IN_USE | if dir { FLAG_DIR } else { 0 };
        let seq = if inum == 5 { ROOT_SEQ } else { 1 };
        let mut r = Record::new(seq, flags, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x06));
        r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, name, 3, dir, 0));
        r
    }

    fn system_records(&mut self) {
        let mft_runs: Vec<_> = self.mft_runs.iter().map(|(a, l)| (*l, Some(*a))).collect();
        let mut r = self.system_file(0, "$MFT", false);
        r.non_resident(ATTR_DATA, None, "", 0, &mft_runs, MFT_RECORDS * RECORD_SIZE as u64, 0);
        self.put_record(0, r);

        let mut r = self.system_file(3, "$Volume", false);
        let mut info = vec![0u8; 12];
        info[8] = 3;
        info[9] = 1;
        r.resident(ATTR_VOLINFO, None, "", &info);
        self.put_record(3, r);

        let mut r = self.system_file(6, "$Bitmap", false);
        r.non_resident(
            ATTR_DATA,
            None,
            "",
            0,
            &[(1, Some(BITMAP_CLUSTER))],
            TOTAL_CLUSTERS / 8,
            0,
        );
        self.put_record(6, r);

        let mut r = self.system_file(7, "$Boot", false);
        r.non_resident(ATTR_DATA, None, "", 0, &[(1, Some(0))], CLUSTER_SIZE, 0);
        self.put_record(7, r);

        let root_entries = vec![
            index_entry(FILE_PLAIN, 1, &file_name(5, ROOT_SEQ, "plain.txt", 1, false, PLAIN_SIZE)),
            index_entry(FILE_RESIDENT, 1, &file_name(5, ROOT_SEQ, "readonly.txt", 3, false, 0)),
            index_entry(SUBDIR, SUBDIR_SEQ, &file_name(5, ROOT_SEQ, "subdir", 3, true, 0)),
            index_entry(FILE_SPLIT, 1, &file_name(5, ROOT_SEQ, "split.bin", 3, false, SPLIT_SIZE)),
            index_entry(FILE_SPARSE, 1, &file_name(5, ROOT_SEQ, "sparse.bin", 3, false, 0)),
            index_entry(FILE_COMPRESSED, 1, &file_name(5, ROOT_SEQ, "comp.bin", 3, false, 0)),
            end_entry(None),
        ];
        let mut r = self.system_file(5, ".", true);
        r.resident(ATTR_IDXROOT, None, "$I30", &index_root(&root_entries, false));
        self.put_record(5, r);
    }

    fn files(&mut self, plain_name: &str) {
        // plain file, two clusters, with a DOS name and nonzero slack
        let mut r = Record::new(1, FLAG_IN_USE, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x20));
        r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, plain_name, 1, false, PLAIN_SIZE));
        r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, "PLAIN~1.TXT", 2, false, PLAIN_SIZE));
        r.non_resident(ATTR_DATA, None, "", 0, &[(2, Some(PLAIN_DATA_CLUSTER))], PLAIN_SIZE, 0);
        self.put_record(FILE_PLAIN, r);
        let mut data = vec![0xEEu8; 2 * CLUSTER_SIZE as usize];
        data[..PLAIN_SIZE as usize].copy_from_slice(&plain_content());
        self.write_cluster(PLAIN_DATA_CLUSTER, &data);

        // read-only file with resident content and a named stream
        let mut r = Record::new(1, FLAG_IN_USE, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x01));
        r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, "readonly.txt", 3, false, 0));
        r.resident(ATTR_DATA, None, "", RESIDENT_CONTENT);
        r.resident(ATTR_DATA, None, "ads", b"xyz");
        self.put_record(FILE_RESIDENT, r);

        self.subdir();

        self.split_file(None);

        // deleted file whose attribute list points at a reused entry
        let mut r = Record::new(2, 0, 0);
        let si = r.resident(ATTR_SI, None, "", &standard_si(0x20));
        let fname = r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, "stale.bin", 3, false, 0));
        let list = [
            list_entry(ATTR_SI, 0, FILE_STALE_LIST, si),
            list_entry(ATTR_FN, 0, FILE_STALE_LIST, fname),
            list_entry(ATTR_DATA, 0, FILE_PLAIN, 5),
        ]
        .concat();
        r.resident(ATTR_LIST, None, "", &list);
        self.put_record(FILE_STALE_LIST, r);

        // data, hole, data
        let mut r = Record::new(1, FLAG_IN_USE, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x220));
        r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, "sparse.bin", 3, false, 0));
        r.non_resident(
            ATTR_DATA,
            None,
            "",
            0,
            &[
                (1, Some(SPARSE_FIRST_CLUSTER)),
                (1, None),
                (1, Some(SPARSE_LAST_CLUSTER)),
            ],
            3 * CLUSTER_SIZE,
            0x8000,
        );
        self.put_record(FILE_SPARSE, r);
        self.write_cluster(SPARSE_FIRST_CLUSTER, &[0x61; CLUSTER_SIZE as usize]);
        self.write_cluster(SPARSE_LAST_CLUSTER, &[0x62; CLUSTER_SIZE as usize]);

        let mut r = Record::new(1, FLAG_IN_USE, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x820));
        r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, "comp.bin", 3, false, 0));
        r.non_resident(ATTR_DATA, None, "", 0, &[(1, Some(COMPRESSED_CLUSTER))], 400, 0x0001);
        self.put_record(FILE_COMPRESSED, r);
        self.write_cluster(COMPRESSED_CLUSTER, &[0x71; CLUSTER_SIZE as usize]);

        // names a parent generation the directory no longer has
        let mut r = Record::new(1, FLAG_IN_USE, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x20));
        r.resident(ATTR_FN, None, "", &file_name(SUBDIR, 99, "orphan.txt", 3, false, 4));
        r.resident(ATTR_DATA, None, "", b"lost");
        self.put_record(FILE_ORPHAN, r);
    }

    /// File whose second half of `$DATA` lives in an extension entry. With
    /// `ext_link` the extension also holds a second `$FILE_NAME`.
    fn split_file(&mut self, ext_link: Option<&str>) {
        let mut r = Record::new(1, FLAG_IN_USE, 0);
        let si = r.resident(ATTR_SI, None, "", &standard_si(0x20));
        let fname = r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, "split.bin", 3, false, SPLIT_SIZE));
        let mut list = vec![
            list_entry(ATTR_SI, 0, FILE_SPLIT, si),
            list_entry(ATTR_FN, 0, FILE_SPLIT, fname),
            list_entry(ATTR_DATA, 0, FILE_SPLIT, 3),
            list_entry(ATTR_DATA, 2, FILE_SPLIT_EXT, 3),
            list_entry(ATTR_OBJECT_ID, 0, FILE_SPLIT_EXT, 0),
        ];
        if ext_link.is_some() {
            list.push(list_entry(ATTR_FN, 0, FILE_SPLIT_EXT, 1));
        }
        r.resident(ATTR_LIST, None, "", &list.concat());
        r.non_resident(ATTR_DATA, Some(3), "", 0, &[(2, Some(SPLIT_FIRST_CLUSTER))], SPLIT_SIZE, 0);
        self.put_record(FILE_SPLIT, r);

        let mut r = Record::new(1, FLAG_IN_USE, FILE_SPLIT);
        r.resident(ATTR_OBJECT_ID, Some(0), "", &[0x11; 16]);
        r.non_resident(ATTR_DATA, Some(3), "", 2, &[(2, Some(SPLIT_SECOND_CLUSTER))], 0, 0);
        if let Some(name) = ext_link {
            r.resident(ATTR_FN, Some(1), "", &file_name(5, ROOT_SEQ, name, 1, false, SPLIT_SIZE));
        }
        self.put_record(FILE_SPLIT_EXT, r);
        self.write_cluster(SPLIT_FIRST_CLUSTER, &[0x51; 2 * CLUSTER_SIZE as usize]);
        self.write_cluster(SPLIT_SECOND_CLUSTER, &[0x52; 2 * CLUSTER_SIZE as usize]);
    }

    fn subdir(&mut self) {
        let mut r = Record::new(SUBDIR_SEQ, FLAG_IN_USE | FLAG_DIR, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x10));
        r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, "subdir", 3, true, 0));
        r.resident(ATTR_IDXROOT, None, "$I30", &index_root(&[end_entry(Some(0))], true));
        r.non_resident(
            ATTR_IDXALLOC,
            None,
            "$I30",
            0,
            &[(4, Some(SUBDIR_INDEX_CLUSTER))],
            2 * RECORD_SIZE as u64,
            0,
        );
        self.put_record(SUBDIR, r);

        let child = |inum: u64, name: &str| {
            index_entry(inum, 1, &file_name(SUBDIR, SUBDIR_SEQ, name, 3, false, 6))
        };
        let mut nodes = index_node(
            0,
            &[child(SUBDIR_LIVE, SUBDIR_LIVE_NAME)],
            &[child(SUBDIR_DELETED, SUBDIR_DELETED_NAME)],
        );
        nodes.extend(index_node(2, &[child(SUBDIR_SECOND, SUBDIR_SECOND_NAME)], &[]));
        self.write_cluster(SUBDIR_INDEX_CLUSTER, &nodes);

        for (inum, name) in [
            (SUBDIR_LIVE, SUBDIR_LIVE_NAME),
            (SUBDIR_SECOND, SUBDIR_SECOND_NAME),
        ] {
            let mut r = Record::new(1, FLAG_IN_USE, 0);
            r.resident(ATTR_SI, None, "", &standard_si(0x20));
            r.resident(ATTR_FN, None, "", &file_name(SUBDIR, SUBDIR_SEQ, name, 3, false, 6));
            r.resident(ATTR_DATA, None, "", b"inside");
            self.put_record(inum, r);
        }
    }

    /// Give [`FILE_SPLIT`] a second name stored in its extension entry.
    pub fn link_name_in_extension(&mut self, name: &str) {
        self.split_file(Some(name));
    }

    /// Directory [`LOOP_DIR`] that is its own parent and lists itself.
    pub fn add_looping_dir(&mut self) {
        let fname = file_name(LOOP_DIR, 1, LOOP_DIR_NAME, 1, true, 0);
        let mut r = Record::new(1, FLAG_IN_USE | FLAG_DIR, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x10));
        r.resident(ATTR_FN, None, "", &fname);
        let entries = [index_entry(LOOP_DIR, 1, &fname), end_entry(None)];
        r.resident(ATTR_IDXROOT, None, "$I30", &index_root(&entries, false));
        self.put_record(LOOP_DIR, r);
    }

    /// Base entry [`TWIN_STREAMS`] with two unnamed non-resident `$DATA`
    /// attributes, the second one with id 0.
    pub fn add_twin_streams(&mut self) {
        let mut r = Record::new(1, FLAG_IN_USE, 0);
        r.resident(ATTR_SI, None, "", &standard_si(0x20));
        r.resident(ATTR_FN, None, "", &file_name(5, ROOT_SEQ, "twins.bin", 1, false, 0));
        r.non_resident(ATTR_DATA, Some(3), "", 0, &[(1, Some(PLAIN_DATA_CLUSTER))], CLUSTER_SIZE, 0);
        r.non_resident(ATTR_DATA, Some(0), "", 0, &[(1, Some(SPARSE_FIRST_CLUSTER))], CLUSTER_SIZE, 0);
        self.put_record(TWIN_STREAMS, r);
    }

    /// Hand the first attribute of type `ty` in entry `inum` to `patch`,
    /// header included.
    pub fn patch_attr(&mut self, inum: u64, ty: u32, patch: impl FnOnce(&mut [u8])) {
        let rec = &mut self.mft[inum as usize * RECORD_SIZE..(inum as usize + 1) * RECORD_SIZE];
        let mut off = 0x38;
        while off + 8 <= RECORD_SIZE {
            let at = u32::from_le_bytes([rec[off], rec[off + 1], rec[off + 2], rec[off + 3]]);
            let len = u32::from_le_bytes([rec[off + 4], rec[off + 5], rec[off + 6], rec[off + 7]]) as usize;
            if at == 0xFFFF_FFFF || len == 0 {
                break;
            }
            if at == ty {
                patch(&mut rec[off..off + len]);
                return;
            }
            off += len;
        }
        panic!("entry {} has no attribute 0x{:X}", inum, ty);
    }

    /// Damage the update sequence of the first index node of [`SUBDIR`].
    pub fn corrupt_index_node(&mut self) {
        let off = (SUBDIR_INDEX_CLUSTER * CLUSTER_SIZE) as usize + 510;
        self.img[off] ^= 0xFF;
    }

    /// Flip the in-use flag of an entry before it is sealed.
    pub fn set_in_use(&mut self, inum: u64, in_use: bool) {
        let off = inum as usize * RECORD_SIZE + 22;
        if in_use {
            self.mft[off] |= FLAG_IN_USE as u8;
        } else {
            self.mft[off] &= !(FLAG_IN_USE as u8);
        }
    }

    /// Damage the update sequence marker at the end of the entry's second
    /// sector.
    pub fn corrupt_record_tail(&mut self, inum: u64) {
        self.corrupt_tails.push(inum);
    }

    pub fn finish(mut self) -> Cursor<Vec<u8>> {
        for slot in self.mft.chunks_exact_mut(RECORD_SIZE) {
            if &slot[0..4] == b"FILE" {
                seal(slot, 0x30, 0x0003);
            }
        }
        for inum in &self.corrupt_tails {
            self.mft[*inum as usize * RECORD_SIZE + RECORD_SIZE - 2] ^= 0xFF;
        }

        let mut pos = 0usize;
        for (addr, len) in &self.mft_runs {
            let bytes = (*len * CLUSTER_SIZE) as usize;
            let off = (*addr * CLUSTER_SIZE) as usize;
            self.img[off..off + bytes].copy_from_slice(&self.mft[pos..pos + bytes]);
            pos += bytes;
        }

        let mut bitmap = vec![0u8; CLUSTER_SIZE as usize];
        for c in &self.allocated {
            bitmap[(*c / 8) as usize] |= 1 << (c % 8);
        }
        let off = (BITMAP_CLUSTER * CLUSTER_SIZE) as usize;
        self.img[off..off + bitmap.len()].copy_from_slice(&bitmap);

        self.img[0..512].copy_from_slice(&boot_sector());
        Cursor::new(self.img)
    }
}

fn boot_sector() -> Vec<u8> {
    let mut b = vec![0u8; 512];
    b[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    b[3..11].copy_from_slice(b"NTFS    ");
    put_u16(&mut b, 0x0B, 512);
    b[0x0D] = 1;
    b[0x15] = 0xF8;
    put_u64(&mut b, 0x28, TOTAL_CLUSTERS);
    put_u64(&mut b, 0x30, MFT_CLUSTER);
    put_u64(&mut b, 0x38, 2);
    b[0x40] = (-10i8) as u8;
    b[0x44] = 2;
    put_u64(&mut b, 0x48, 0x0BAD_CAFE_F00D_0001);
    put_u16(&mut b, 0x1FE, 0xAA55);
    b
}

pub fn standard_image() -> Cursor<Vec<u8>> {
    ImageBuilder::standard().finish()
}

/// `$MFT` in two runs, the first ending halfway through [`SPLIT_RECORD`].
pub fn split_mft_image() -> Cursor<Vec<u8>> {
    let first = SPLIT_RECORD * RECORD_SIZE as u64 / CLUSTER_SIZE + 1;
    ImageBuilder::new(
        vec![(MFT_CLUSTER, first), (96, MFT_CLUSTERS - first)],
        "straddle.txt",
    )
    .finish()
}
