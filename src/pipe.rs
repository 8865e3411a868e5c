//! Pipes.
//!
//! pipefs is an internal kernel mount: pipe inodes are anonymous in-core
//! inodes whose private state indexes a fixed pool of ring buffers.
//! Readers and writers rendezvous on the two wait channels; all wakeups
//! are broadcast and every sleeper rechecks its condition.

use array_macro::array;

use crate::{
    errno::{Errno, Result},
    file::{fd_alloc, readable, writable, OpenFile, O_RDONLY, O_WRONLY},
    fs::{
        inode::InodeExt, FileOps, FsOpFlags, FsOps, FilesystemType, InodeRef, SelectEvent,
        S_IFIFO,
    },
    kernel::kernel,
    lock::SpinLock,
    param::{NR_PIPES, PIPESIZE},
    proc::{current_proc_data, WaitChannel},
    signal::{send_sig_current, SIGPIPE},
};

pub struct PipeInner {
    data: [u8; PIPESIZE],
    /// Bytes read and written since creation; the difference is the
    /// fill level and the indices wrap modulo PIPESIZE.
    nread: u32,
    nwrite: u32,
    readopen: bool,
    writeopen: bool,
    in_use: bool,
}

#[derive(Debug)]
pub enum PipeError {
    /// Nothing to do until the other side acts; sleep and retry.
    WaitForIO,
    /// No readers remain; the write raises SIGPIPE/EPIPE.
    Closed,
}

impl PipeInner {
    const fn zero() -> Self {
        Self {
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            readopen: false,
            writeopen: false,
            in_use: false,
        }
    }

    fn len(&self) -> usize {
        self.nwrite.wrapping_sub(self.nread) as usize
    }

    /// Read up to `buf.len()` bytes.
    pub fn try_read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, PipeError> {
        if self.len() == 0 {
            if self.writeopen {
                return Err(PipeError::WaitForIO);
            }
            // Writers gone: end of file.
            return Ok(0);
        }
        let n = core::cmp::min(buf.len(), self.len());
        for slot in buf[..n].iter_mut() {
            *slot = self.data[self.nread as usize % PIPESIZE];
            self.nread = self.nread.wrapping_add(1);
        }
        Ok(n)
    }

    /// Write up to `buf.len()` bytes; partial writes happen when the
    /// ring fills mid-copy.
    pub fn try_write(&mut self, buf: &[u8]) -> core::result::Result<usize, PipeError> {
        if !self.readopen {
            return Err(PipeError::Closed);
        }
        if self.len() == PIPESIZE {
            return Err(PipeError::WaitForIO);
        }
        let room = PIPESIZE - self.len();
        let n = core::cmp::min(buf.len(), room);
        for &b in &buf[..n] {
            self.data[self.nwrite as usize % PIPESIZE] = b;
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(n)
    }

    pub fn ready(&self, event: SelectEvent) -> bool {
        match event {
            SelectEvent::Read => self.len() > 0 || !self.writeopen,
            SelectEvent::Write => self.len() < PIPESIZE || !self.readopen,
            SelectEvent::Except => false,
        }
    }
}

pub struct Pipe {
    pub inner: SpinLock<PipeInner>,
    read_wait: WaitChannel,
    write_wait: WaitChannel,
}

impl Pipe {
    const fn zero() -> Self {
        Self {
            inner: SpinLock::new("pipe", PipeInner::zero()),
            read_wait: WaitChannel::new(),
            write_wait: WaitChannel::new(),
        }
    }
}

pub struct PipePool {
    pipes: [Pipe; NR_PIPES],
}

impl PipePool {
    pub const fn zero() -> Self {
        Self {
            pipes: array![_ => Pipe::zero(); NR_PIPES],
        }
    }

    pub fn pipe(&self, idx: u16) -> &Pipe {
        &self.pipes[idx as usize]
    }

    fn alloc(&self) -> Result<u16> {
        for (idx, p) in self.pipes.iter().enumerate() {
            let mut inner = p.inner.lock();
            if !inner.in_use {
                *inner = PipeInner::zero();
                inner.in_use = true;
                inner.readopen = true;
                inner.writeopen = true;
                return Ok(idx as u16);
            }
        }
        Err(Errno::ENFILE)
    }
}

fn pipe_of(ino: InodeRef) -> Result<u16> {
    kernel().itable.with(ino, |i| match i.ext {
        InodeExt::Pipe(idx) => Ok(idx),
        _ => Err(Errno::EINVAL),
    })
}

struct PipeFileOps;

impl FileOps for PipeFileOps {
    fn read(&self, ino: InodeRef, _file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        let pipe = kernel().pipes.pipe(pipe_of(ino)?);
        let mut inner = pipe.inner.lock();
        loop {
            match inner.try_read(buf) {
                Ok(n) => {
                    pipe.write_wait.wakeup();
                    crate::fs::SELECT_WAIT.wakeup();
                    return Ok(n);
                }
                Err(PipeError::WaitForIO) => {
                    pipe.read_wait.sleep_interruptible(&mut inner)?;
                }
                Err(PipeError::Closed) => return Err(Errno::EPIPE),
            }
        }
    }

    fn write(&self, ino: InodeRef, _file: &mut OpenFile, buf: &[u8]) -> Result<usize> {
        let pipe = kernel().pipes.pipe(pipe_of(ino)?);
        let mut written = 0;
        let mut inner = pipe.inner.lock();
        loop {
            match inner.try_write(&buf[written..]) {
                Ok(n) => {
                    written += n;
                    pipe.read_wait.wakeup();
                    crate::fs::SELECT_WAIT.wakeup();
                    if written == buf.len() {
                        return Ok(written);
                    }
                    pipe.write_wait.sleep_interruptible(&mut inner)?;
                }
                Err(PipeError::WaitForIO) => {
                    pipe.write_wait.sleep_interruptible(&mut inner)?;
                }
                Err(PipeError::Closed) => {
                    drop(inner);
                    send_sig_current(SIGPIPE);
                    return Err(Errno::EPIPE);
                }
            }
        }
    }

    fn close(&self, ino: InodeRef, file: &mut OpenFile) -> Result<()> {
        let pipe = kernel().pipes.pipe(pipe_of(ino)?);
        let mut inner = pipe.inner.lock();
        if writable(file.flags) {
            inner.writeopen = false;
            pipe.read_wait.wakeup();
        }
        if readable(file.flags) {
            inner.readopen = false;
            pipe.write_wait.wakeup();
        }
        if !inner.readopen && !inner.writeopen {
            inner.in_use = false;
        }
        drop(inner);
        crate::fs::SELECT_WAIT.wakeup();
        Ok(())
    }

    fn llseek(&self, _ino: InodeRef, _offset: i64) -> Result<i64> {
        Err(Errno::ESPIPE)
    }

    fn select(&self, ino: InodeRef, event: SelectEvent) -> Result<bool> {
        let pipe = kernel().pipes.pipe(pipe_of(ino)?);
        let inner = pipe.inner.lock();
        Ok(inner.ready(event))
    }
}

static PIPE_FILE_OPS: PipeFileOps = PipeFileOps;

pub static PIPEFS_OPS: FsOps = FsOps {
    flags: FsOpFlags::KERN_MOUNT,
    fops: &PIPE_FILE_OPS,
    iops: &crate::fs::NO_OPS,
    bops: &crate::fs::NO_OPS,
    sops: &crate::fs::NO_OPS,
};

pub static PIPEFS_TYPE: FilesystemType = FilesystemType {
    name: "pipefs",
    ops: &PIPEFS_OPS,
};

/// Create a pipe; returns the read and write descriptors.
pub fn do_pipe() -> Result<(i32, i32)> {
    let slot = kernel().pipes.alloc()?;
    let free_pipe = |slot: u16| {
        kernel().pipes.pipe(slot).inner.lock().in_use = false;
    };

    let ino = match kernel()
        .itable
        .alloc_anonymous(None, S_IFIFO | 0o600, None)
    {
        Ok(ino) => ino,
        Err(e) => {
            free_pipe(slot);
            return Err(e);
        }
    };
    kernel().itable.with(ino, |i| i.ext = InodeExt::Pipe(slot));

    let r = {
        let mut ftable = kernel().ftable.inner.lock();
        ftable.alloc(Some(ino), O_RDONLY, &PIPE_FILE_OPS)
    };
    let r = match r {
        Ok(r) => r,
        Err(e) => {
            kernel().itable.iput(ino);
            free_pipe(slot);
            return Err(e);
        }
    };
    kernel().itable.idup(ino);
    let w = {
        let mut ftable = kernel().ftable.inner.lock();
        ftable.alloc(Some(ino), O_WRONLY, &PIPE_FILE_OPS)
    };
    let w = match w {
        Ok(w) => w,
        Err(e) => {
            crate::syscall::close_file(r);
            free_pipe(slot);
            return Err(e);
        }
    };

    let data = unsafe { current_proc_data() };
    let fd0 = match fd_alloc(data, r, 0) {
        Ok(fd) => fd,
        Err(e) => {
            crate::syscall::close_file(r);
            crate::syscall::close_file(w);
            return Err(e);
        }
    };
    let fd1 = match fd_alloc(data, w, 0) {
        Ok(fd) => fd,
        Err(e) => {
            data.fd_table[fd0 as usize] = None;
            crate::syscall::close_file(r);
            crate::syscall::close_file(w);
            return Err(e);
        }
    };
    Ok((fd0, fd1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_pipe() -> PipeInner {
        let mut p = PipeInner::zero();
        p.in_use = true;
        p.readopen = true;
        p.writeopen = true;
        p
    }

    #[test]
    fn bytes_round_trip_in_order() {
        let mut p = open_pipe();
        assert_eq!(p.try_write(b"hello\n").unwrap(), 6);
        let mut buf = [0u8; 16];
        let n = p.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn empty_pipe_with_writer_waits() {
        let mut p = open_pipe();
        let mut buf = [0u8; 4];
        assert!(matches!(p.try_read(&mut buf), Err(PipeError::WaitForIO)));
    }

    #[test]
    fn empty_pipe_without_writer_is_eof() {
        let mut p = open_pipe();
        p.writeopen = false;
        let mut buf = [0u8; 4];
        assert_eq!(p.try_read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn full_pipe_backpressures_then_drains() {
        let mut p = open_pipe();
        let big = [7u8; PIPESIZE + 10];
        assert_eq!(p.try_write(&big).unwrap(), PIPESIZE);
        assert!(matches!(p.try_write(&big), Err(PipeError::WaitForIO)));
        let mut buf = [0u8; 10];
        assert_eq!(p.try_read(&mut buf).unwrap(), 10);
        assert_eq!(p.try_write(&big).unwrap(), 10);
    }

    #[test]
    fn write_without_readers_is_closed() {
        let mut p = open_pipe();
        p.readopen = false;
        assert!(matches!(p.try_write(b"x"), Err(PipeError::Closed)));
    }

    #[test]
    fn wraparound_preserves_order() {
        let mut p = open_pipe();
        let mut buf = [0u8; PIPESIZE];
        // Fill and drain repeatedly so the indices wrap.
        for round in 0..5u8 {
            let chunk = [round; 1000];
            assert_eq!(p.try_write(&chunk).unwrap(), 1000);
            let n = p.try_read(&mut buf[..1000]).unwrap();
            assert_eq!(n, 1000);
            assert!(buf[..n].iter().all(|b| *b == round));
        }
    }

    #[test]
    fn select_readiness() {
        let mut p = open_pipe();
        assert!(!p.ready(SelectEvent::Read));
        assert!(p.ready(SelectEvent::Write));
        p.try_write(b"data").unwrap();
        assert!(p.ready(SelectEvent::Read));
        // A full pipe is not writable.
        let big = [0u8; PIPESIZE];
        let _ = p.try_write(&big);
        assert!(!p.ready(SelectEvent::Write));
        // Closed ends make both ready (EOF / EPIPE are "ready" states).
        p.writeopen = false;
        assert!(p.ready(SelectEvent::Read));
    }
}
