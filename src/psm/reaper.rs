// src/psm/reaper.rs

//! SIGCHLD-driven reaping of scriptlet children
//!
//! A process-wide `SIGCHLD` handler reaps only the pids registered in a
//! fixed table, so children spawned elsewhere in the process (including by
//! `std::process`) are left for their owners. The handler stores the raw
//! wait status in the slot and pokes a self-pipe that waiters poll.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, write, Pid};
use std::ffi::c_int;
use std::fs::File;
use std::io::{self, Read};
use std::marker::PhantomData;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use tracing::trace;

const SLOTS: usize = 64;
const POLL_MS: u16 = 50;
/// Consecutive ECHILD results tolerated before giving up on a child
const ECHILD_LIMIT: u32 = 20;

const FREE: u8 = 0;
const WAITING: u8 = 1;
const REAPED: u8 = 2;
const CLAIMING: u8 = 3;

struct Slot {
    pid: AtomicI32,
    status: AtomicI32,
    state: AtomicU8,
}

impl Slot {
    const fn new() -> Self {
        Self {
            pid: AtomicI32::new(0),
            status: AtomicI32::new(0),
            state: AtomicU8::new(FREE),
        }
    }

    /// Record a wait status unless someone else already did
    fn store_reaped(&self, status: i32) {
        self.status.store(status, Ordering::SeqCst);
        let _ = self
            .state
            .compare_exchange(WAITING, REAPED, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Reap the slot's child if it has terminated
    fn try_reap(&self, pid: Pid) -> nix::Result<()> {
        if let Some(raw) = raw_status(waitpid(pid, Some(WaitPidFlag::WNOHANG))?) {
            self.store_reaped(raw);
        }
        Ok(())
    }
}

struct SelfPipe {
    read: File,
    write: OwnedFd,
}

static TABLE: [Slot; SLOTS] = [const { Slot::new() }; SLOTS];
static PIPE: OnceLock<SelfPipe> = OnceLock::new();
static INSTALLED: OnceLock<Result<(), Errno>> = OnceLock::new();

/// Encode a terminal wait status the way `wait(2)` reports it
fn raw_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some((code & 0xff) << 8),
        WaitStatus::Signaled(_, signal, core) => Some(signal as i32 | if core { 0x80 } else { 0 }),
        _ => None,
    }
}

extern "C" fn on_sigchld(_signal: c_int) {
    // Only async-signal-safe calls below
    let errno = Errno::last_raw();

    for slot in TABLE.iter() {
        if slot.state.load(Ordering::SeqCst) != WAITING {
            continue;
        }
        let _ = slot.try_reap(Pid::from_raw(slot.pid.load(Ordering::SeqCst)));
    }

    if let Some(pipe) = PIPE.get() {
        let _ = write(&pipe.write, &[1]);
    }

    Errno::set_raw(errno);
}

fn install_handler() -> Result<(), Errno> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
    let _ = PIPE.set(SelfPipe {
        read: File::from(read),
        write,
    });

    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    // The handler touches only atomics, waitpid and the self-pipe
    unsafe { sigaction(Signal::SIGCHLD, &action) }?;

    trace!("SIGCHLD handler installed");
    Ok(())
}

/// Blocks SIGCHLD on the current thread until dropped
struct SigchldBlock {
    previous: SigSet,
}

impl SigchldBlock {
    fn new() -> io::Result<Self> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGCHLD);
        let previous = set.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
        Ok(Self { previous })
    }
}

impl Drop for SigchldBlock {
    fn drop(&mut self) {
        let _ = self.previous.thread_set_mask();
    }
}

/// Handle on the process-wide child reaper
#[derive(Debug)]
pub struct Reaper {
    _installed: (),
}

impl Reaper {
    /// Install the SIGCHLD handler (once per process)
    pub fn new() -> io::Result<Self> {
        match INSTALLED.get_or_init(install_handler) {
            Ok(()) => Ok(Self { _installed: () }),
            Err(errno) => Err(io::Error::from(*errno)),
        }
    }

    /// Start tracking a spawned child
    pub fn register(&self, pid: u32) -> io::Result<ChildGuard<'_>> {
        let pid = Pid::from_raw(pid as i32);
        let _blocked = SigchldBlock::new()?;

        let slot = TABLE
            .iter()
            .position(|slot| {
                slot.state
                    .compare_exchange(FREE, CLAIMING, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            })
            .ok_or_else(|| io::Error::other("too many scriptlet children"))?;

        TABLE[slot].pid.store(pid.as_raw(), Ordering::SeqCst);
        TABLE[slot].status.store(0, Ordering::SeqCst);
        TABLE[slot].state.store(WAITING, Ordering::SeqCst);

        // The child may have exited before it was registered
        let _ = TABLE[slot].try_reap(pid);

        trace!("Registered child {} in slot {}", pid, slot);
        Ok(ChildGuard {
            slot,
            pid,
            _reaper: PhantomData,
        })
    }
}

/// A registered child; frees its table slot on drop
#[derive(Debug)]
pub struct ChildGuard<'a> {
    slot: usize,
    pid: Pid,
    _reaper: PhantomData<&'a Reaper>,
}

impl ChildGuard<'_> {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Exit status if the child has been reaped
    pub fn try_status(&self) -> Option<ExitStatus> {
        let slot = &TABLE[self.slot];
        if slot.state.load(Ordering::SeqCst) == REAPED {
            Some(ExitStatus::from_raw(slot.status.load(Ordering::SeqCst)))
        } else {
            None
        }
    }

    /// Block until the child has been reaped
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        let slot = &TABLE[self.slot];
        let mut lost = 0;
        loop {
            if let Some(status) = self.try_status() {
                return Ok(status);
            }

            if let Some(pipe) = PIPE.get() {
                let mut fds = [PollFd::new(pipe.read.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(POLL_MS)) {
                    Ok(ready) if ready > 0 => {
                        let mut drain = [0u8; 64];
                        let _ = (&pipe.read).read(&mut drain);
                    }
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            // Missed wakeups: reap directly
            match slot.try_reap(self.pid) {
                Ok(()) => {}
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    // The handler may be between its waitpid and recording the status
                    lost += 1;
                    if lost >= ECHILD_LIMIT && slot.state.load(Ordering::SeqCst) != REAPED {
                        return Err(Errno::ECHILD.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        let slot = &TABLE[self.slot];
        if slot.state.load(Ordering::SeqCst) == WAITING {
            let _ = slot.try_reap(self.pid);
        }
        slot.pid.store(0, Ordering::SeqCst);
        slot.state.store(FREE, Ordering::SeqCst);
    }
}
