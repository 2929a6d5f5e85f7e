use crate::{*, error::*};
use std::{collections::BTreeMap, sync::{Arc, RwLock, atomic::{AtomicBool, AtomicU64, Ordering}}};
use libc::{pid_t, c_void};

// Debuggee memory, as seen by the pipeline. Implementations must be usable from multiple threads at once:
// independent watches are evaluated concurrently, each with its own CachedMemReader on top of the shared provider.
pub trait MemoryReader: Send + Sync {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()>;

    // Failures are per request; one unreadable range doesn't fail the others.
    fn read_batch(&self, requests: &mut [(usize, &mut [u8])]) -> Vec<Result<()>> {
        requests.iter_mut().map(|(addr, buf)| self.read(*addr, buf)).collect()
    }

    // Changes whenever memory contents may have changed (e.g. the debuggee ran, or a value was edited).
    fn version(&self) -> u64 { 0 }
}

pub trait MemoryWriter: Send + Sync {
    // One write call per edit; either all bytes are written or none.
    fn write(&self, addr: usize, data: &[u8]) -> Result<()>;
}

// Set when the watch row scrolls out of view or the watch is re-evaluated. Checked before every memory read.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self { Self::default() }
    pub fn cancel(&self) { self.0.store(true, Ordering::Relaxed); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Relaxed) }
    pub fn check(&self) -> Result<()> { if self.is_cancelled() { err!(Cancelled, "cancelled") } else { Ok(()) } }
}

// In-memory copy of some address ranges. Used for tests, for the demo binary, and for core-dump-like snapshots.
pub struct SnapshotMemory {
    regions: RwLock<BTreeMap<usize, Vec<u8>>>,
    version: AtomicU64,
}

impl SnapshotMemory {
    pub fn new() -> Self { Self {regions: RwLock::new(BTreeMap::new()), version: AtomicU64::new(1)} }

    // Regions must not overlap.
    pub fn map(&self, addr: usize, bytes: Vec<u8>) {
        self.regions.write().unwrap().insert(addr, bytes);
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    fn with_region<R>(&self, addr: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let regions = self.regions.read().unwrap();
        let Some((&start, bytes)) = regions.range(..=addr).next_back() else { return err!(Unreadable, "bad address 0x{:x}", addr) };
        let off = addr - start;
        if off.checked_add(len).map_or(true, |end| end > bytes.len()) {
            return err!(Unreadable, "bad address 0x{:x}", addr);
        }
        Ok(f(&bytes[off..off+len]))
    }
}

impl MemoryReader for SnapshotMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.with_region(addr, buf.len(), |src| buf.copy_from_slice(src))
    }

    fn version(&self) -> u64 { self.version.load(Ordering::Relaxed) }
}

impl MemoryWriter for SnapshotMemory {
    fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let mut regions = self.regions.write().unwrap();
        let Some((&start, bytes)) = regions.range_mut(..=addr).next_back() else { return err!(Unreadable, "bad address 0x{:x}", addr) };
        let off = addr - start;
        if off.checked_add(data.len()).map_or(true, |end| end > bytes.len()) {
            return err!(Unreadable, "bad address 0x{:x}", addr);
        }
        bytes[off..off+data.len()].copy_from_slice(data);
        self.version.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// Live process.
#[derive(Clone)]
pub struct PidMemReader {
    pid: pid_t,
}

impl PidMemReader {
    pub fn new(pid: pid_t) -> Self { PidMemReader {pid} }
}

impl MemoryReader for PidMemReader {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let r = unsafe {
            let local_iov = libc::iovec {iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: buf.len()};
            let remote_iov = libc::iovec {iov_base: addr as *mut c_void, iov_len: buf.len()};
            libc::process_vm_readv(self.pid, &local_iov as *const libc::iovec, 1, &remote_iov as *const libc::iovec, 1, 0)
        };
        if r < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EFAULT) {
                return err!(Unreadable, "bad address 0x{:x}", addr); // shorter message for common error (e.g. null pointer)
            }
            return errno_err!("process_vm_readv failed");
        }
        if r != buf.len() as isize {
            return err!(Unreadable, "partial read @0x{:x}:0x{:x}", addr, buf.len());
        }
        Ok(())
    }
}

impl MemoryWriter for PidMemReader {
    fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let r = unsafe {
            let local_iov = libc::iovec {iov_base: data.as_ptr() as *mut c_void, iov_len: data.len()};
            let remote_iov = libc::iovec {iov_base: addr as *mut c_void, iov_len: data.len()};
            libc::process_vm_writev(self.pid, &local_iov as *const libc::iovec, 1, &remote_iov as *const libc::iovec, 1, 0)
        };
        if r < 0 {
            return errno_err!("process_vm_writev failed");
        }
        if r != data.len() as isize {
            return err!(ProcessState, "partial write @0x{:x}:0x{:x}", addr, data.len());
        }
        Ok(())
    }
}

const PAGE_SIZE: usize = 4096;

// Reads debuggee's memory, caches last read page. Good for sequential small reads, which is what formatting a struct does.
// One per pipeline run; never shared between threads.
pub struct CachedMemReader<'a> {
    pub mem: &'a dyn MemoryReader,
    pub cancel: CancelToken,
    addr: Option<usize>,
    page: Box<[u8; PAGE_SIZE]>,
    pub num_reads: usize,
}

impl<'a> CachedMemReader<'a> {
    pub fn new(mem: &'a dyn MemoryReader, cancel: CancelToken) -> Self { Self {mem, cancel, addr: None, page: Box::new([0; PAGE_SIZE]), num_reads: 0} }

    pub fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.cancel.check()?;
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() > usize::MAX - addr {
            return err!(Unreadable, "bad memory range: 0x{:x} + 0x{:x}", addr, buf.len());
        }
        let page_addr = addr & !(PAGE_SIZE - 1);
        if (addr + buf.len() - 1) & !(PAGE_SIZE - 1) != page_addr {
            // Spans pages, don't bother with the cache.
            self.num_reads += 1;
            return self.mem.read(addr, buf);
        }
        if self.addr != Some(page_addr) {
            self.num_reads += 1;
            if self.mem.read(page_addr, &mut self.page[..]).is_ok() {
                self.addr = Some(page_addr);
            } else {
                // Page is only partially readable (or not at all). Read just the requested bytes.
                self.addr = None;
                return self.mem.read(addr, buf);
            }
        }
        let off = addr - page_addr;
        buf.copy_from_slice(&self.page[off..off+buf.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, memory::*};

    #[test]
    fn snapshot_reads_and_writes() {
        let m = SnapshotMemory::new();
        m.map(0x1000, (0..16u8).collect());
        let mut buf = [0u8; 4];
        m.read(0x1004, &mut buf).unwrap();
        assert_eq!(buf, [4, 5, 6, 7]);
        assert!(m.read(0x100e, &mut buf).unwrap_err().is_unreadable());
        assert!(m.read(0x0ff0, &mut buf).unwrap_err().is_unreadable());

        let v = m.version();
        m.write(0x1000, &[0xaa, 0xbb]).unwrap();
        assert!(m.version() > v);
        m.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xbb, 2, 3]);
        assert!(m.write(0x2000, &[1]).is_err());

        let (mut a, mut b) = ([0u8; 2], [0u8; 2]);
        let res = m.read_batch(&mut [(0x1000, &mut a[..]), (0x5000, &mut b[..])]);
        assert!(res[0].is_ok());
        assert!(res[1].as_ref().unwrap_err().is_unreadable());
    }

    #[test]
    fn cached_reader() {
        let m = SnapshotMemory::new();
        m.map(0x1000, vec![7; PAGE_SIZE]);
        m.map(0x2000, vec![9; 8]); // partial page
        let cancel = CancelToken::new();
        let mut r = CachedMemReader::new(&m, cancel.clone());
        let mut buf = [0u8; 8];
        r.read(0x1000, &mut buf).unwrap();
        r.read(0x1010, &mut buf).unwrap();
        assert_eq!(r.num_reads, 1);
        assert_eq!(buf, [7; 8]);
        r.read(0x2000, &mut buf).unwrap();
        assert_eq!(buf, [9; 8]);
        assert!(r.read(0x2004, &mut buf).unwrap_err().is_unreadable());

        cancel.cancel();
        assert!(r.read(0x1000, &mut buf).unwrap_err().is_cancelled());
    }

    #[test]
    fn own_process() {
        let data: [u8; 4] = [1, 2, 3, 4];
        let r = PidMemReader::new(std::process::id() as pid_t);
        let mut buf = [0u8; 4];
        match r.read(std::hint::black_box(&data).as_ptr() as usize, &mut buf) {
            Ok(()) => assert_eq!(buf, data),
            // Sandboxes sometimes forbid process_vm_readv even on ourselves.
            Err(e) => { eprintln!("skipping: {}", e); return; }
        }
        assert!(r.read(8, &mut buf).unwrap_err().is_unreadable());
    }
}
