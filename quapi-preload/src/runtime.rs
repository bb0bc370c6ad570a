// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! The shim runtime: a process-global state machine that turns the typed
//! message stream on fd 0 into the (Q)DIMACS text the solver believes it
//! reads from stdin, and that forks the solver child at the right moment.
//!
//! Each state consumes the current message, may fill the output buffer and
//! yields the next state. A read by the solver first drains the output
//! buffer and only then advances the machine; advancing blocks on the next
//! message unless the `repeat` flag asks to re-enter the current state
//! (used while padding the matrix with filler clauses).

use crate::syms::OrigSyms;
use crate::timing;
use log::{debug, error, trace};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use quapi_common::fdio::FdWriter;
use quapi_common::message::{read_msg, write_msg, HeaderData, Message};
use quapi_common::{ShimState, API_VERSION};
use std::io::Read;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Mutex, PoisonError};

/// Whether any interposed entry point ever fired. Checked at unload to
/// surface solvers whose input path is not wrapped.
pub(crate) static READ_DETECTED: AtomicBool = AtomicBool::new(false);

/// The destructor's DESTRUCTED message is suppressed once the seed process
/// waits on the solver child itself and reports the exit code instead.
pub(crate) static SEND_DESTRUCTED: AtomicBool = AtomicBool::new(true);

static SIGCHLD_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);

fn lock() -> std::sync::MutexGuard<'static, Option<Runtime>> {
    RUNTIME.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn install(rt: Runtime) {
    *lock() = Some(rt);
}

pub(crate) fn take() -> Option<Runtime> {
    lock().take()
}

/// Serves one intercepted read request against the global runtime. Exits
/// the process when the machine decided the stream is over for good.
pub(crate) fn shim_read(out: &mut [u8]) -> isize {
    let outcome = lock().as_mut().map(|rt| rt.read(out));
    match outcome {
        Some(ReadOutcome::Data(n)) => n as isize,
        Some(ReadOutcome::Exit(code)) => std::process::exit(code),
        None => {
            error!("read intercepted but the runtime is not initialized");
            0
        }
    }
}

pub(crate) enum ReadOutcome {
    Data(usize),
    /// The peer closed the stream (0) or the protocol desynced (nonzero);
    /// the process must not continue either way.
    Exit(i32),
}

/// Message input stream of the runtime.
pub(crate) enum MsgInput {
    #[cfg(all(target_os = "linux", feature = "zerocopy"))]
    Splice(quapi_common::pipe::SpliceReader),
    Raw(RawRead),
    #[cfg(test)]
    Mem(std::io::Cursor<Vec<u8>>),
}

impl MsgInput {
    /// Opens the message stream over `fd`, preferring the zero-copy path.
    /// The descriptor is borrowed, not owned.
    pub fn open(fd: RawFd, syms: &OrigSyms) -> Option<MsgInput> {
        #[cfg(all(target_os = "linux", feature = "zerocopy"))]
        {
            match quapi_common::pipe::SpliceReader::new(fd) {
                Ok(reader) => return Some(MsgInput::Splice(reader)),
                Err(e) => error!("zero-copy input unavailable, falling back to read(): {e}"),
            }
        }
        match syms.read {
            Some(read_fn) => Some(MsgInput::Raw(RawRead { fd, read_fn })),
            None => {
                error!("cannot open the message input stream: original read() not resolved");
                None
            }
        }
    }
}

impl Read for MsgInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(all(target_os = "linux", feature = "zerocopy"))]
            MsgInput::Splice(r) => r.read(buf),
            MsgInput::Raw(r) => r.read(buf),
            #[cfg(test)]
            MsgInput::Mem(r) => r.read(buf),
        }
    }
}

/// Fallback input calling the saved original `read` symbol directly; going
/// through the PLT would loop back into the interposed `read`.
pub(crate) struct RawRead {
    fd: RawFd,
    read_fn: crate::syms::ReadFn,
}

impl Read for RawRead {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            // SAFETY: buf is valid for buf.len() writable bytes and the
            // saved symbol is the real read(2).
            let n = unsafe { (self.read_fn)(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

const OUTBUF_CAPACITY: usize = 64;

/// Small output buffer between the state machine and the solver's read
/// requests. Holds at most one production of a state.
struct OutBuf {
    buf: [u8; OUTBUF_CAPACITY],
    len: usize,
    pos: usize,
}

// Two-digit lookup table shared by the integer-to-text path. Must produce
// the same decimal text as naive formatting.
const DIGIT_PAIRS: &[u8; 200] = b"0001020304050607080910111213141516171819\
2021222324252627282930313233343536373839\
4041424344454647484950515253545556575859\
6061626364656667686970717273747576777879\
8081828384858687888990919293949596979899";

impl OutBuf {
    fn new() -> OutBuf {
        OutBuf {
            buf: [0; OUTBUF_CAPACITY],
            len: 0,
            pos: 0,
        }
    }

    fn reset(&mut self) {
        self.len = 0;
        self.pos = 0;
    }

    fn has_pending(&self) -> bool {
        self.pos < self.len
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.len + bytes.len() <= OUTBUF_CAPACITY);
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    fn push_byte(&mut self, byte: u8) {
        self.push_bytes(&[byte]);
    }

    fn push_int(&mut self, value: i32) {
        let mut tmp = [0u8; 12];
        let mut at = tmp.len();
        // Widening keeps the negation of i32::MIN well defined.
        let mut v = (value as i64).unsigned_abs();
        while v >= 100 {
            let pair = ((v % 100) as usize) * 2;
            at -= 2;
            tmp[at..at + 2].copy_from_slice(&DIGIT_PAIRS[pair..pair + 2]);
            v /= 100;
        }
        if v < 10 {
            at -= 1;
            tmp[at] = b'0' + v as u8;
        } else {
            let pair = (v as usize) * 2;
            at -= 2;
            tmp[at..at + 2].copy_from_slice(&DIGIT_PAIRS[pair..pair + 2]);
        }
        if value < 0 {
            at -= 1;
            tmp[at] = b'-';
        }
        self.push_bytes(&tmp[at..]);
    }

    /// Copies pending bytes into `out`, advancing the drain position.
    fn drain(&mut self, out: &mut [u8]) -> usize {
        let n = (self.len - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        if n > 0 {
            trace!("giving {} synthesized bytes to the solver", n);
        }
        n
    }
}

/// The tautological clause used to pad the matrix up to its declared clause
/// count when fewer assumptions arrive than slots were reserved.
struct FillerClause {
    buf: [u8; OUTBUF_CAPACITY],
    len: usize,
}

impl FillerClause {
    fn new() -> FillerClause {
        let mut filler = FillerClause {
            buf: [0; OUTBUF_CAPACITY],
            len: 0,
        };
        filler.set(b"-1 1 0\n");
        filler
    }

    fn set(&mut self, text: &[u8]) {
        debug_assert!(text.len() <= OUTBUF_CAPACITY);
        self.buf[..text.len()].copy_from_slice(text);
        self.len = text.len();
    }

    /// Re-seeds the filler over the first declared variable.
    fn seed(&mut self, var: i32) {
        let text = format!("{var} -{var} 0\n");
        self.set(text.as_bytes());
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

pub(crate) struct Runtime {
    syms: OrigSyms,
    input: Option<MsgInput>,
    /// Descriptor the input stream reads from; closed when the machine
    /// reaches WORKING. Negative when the runtime does not own stdin
    /// (tests).
    input_fd: RawFd,
    header: HeaderData,
    has_header: bool,
    state: ShimState,
    last_msg: Option<Message>,
    outbuf: OutBuf,
    filler: FillerClause,
    written_clauses: i32,
    quantifier_count: u32,
    repeat_state: bool,
    want_next_msg: bool,
    closed: bool,
    exit_requested: Option<i32>,
    solver_child_pid: Option<Pid>,
    /// Stdout as it was before any fork rewired it; always usable for
    /// diagnostics in the seed process.
    #[allow(dead_code)]
    old_stdout: RawFd,
}

impl Runtime {
    pub fn new(syms: OrigSyms) -> Runtime {
        #[cfg(all(target_os = "linux", feature = "zerocopy"))]
        debug!("zero-copy transport active in the preloaded runtime");
        #[cfg(not(all(target_os = "linux", feature = "zerocopy")))]
        debug!("zero-copy transport disabled in the preloaded runtime");

        Runtime {
            syms,
            input: MsgInput::open(libc::STDIN_FILENO, &syms),
            input_fd: libc::STDIN_FILENO,
            header: HeaderData::default(),
            has_header: false,
            state: ShimState::WaitingForHeader,
            last_msg: None,
            outbuf: OutBuf::new(),
            filler: FillerClause::new(),
            written_clauses: 0,
            quantifier_count: 0,
            repeat_state: false,
            want_next_msg: false,
            closed: false,
            exit_requested: None,
            solver_child_pid: None,
            old_stdout: libc::STDOUT_FILENO,
        }
    }

    pub fn report_pipe_fd(&self) -> Option<RawFd> {
        self.has_header.then(|| self.header.message_to_parent_pipe[1])
    }

    /// Serves one read request of the solver: drain pending output first,
    /// then advance the machine for more. A zero-length result with room in
    /// the buffer stores EOF in the caller's first byte.
    pub fn read(&mut self, out: &mut [u8]) -> ReadOutcome {
        timing::first_read();

        let mut n = self.outbuf.drain(out);
        if n == 0 {
            self.outbuf.reset();
            self.advance();
            if let Some(code) = self.exit_requested {
                return ReadOutcome::Exit(code);
            }
            n = self.outbuf.drain(out);
        }

        if n == 0 && !out.is_empty() {
            out[0] = 0xff;
        }
        ReadOutcome::Data(n)
    }

    /// Runs the machine until it produced output, closed the stream or ran
    /// out of messages.
    fn advance(&mut self) {
        if self.closed {
            return;
        }
        if self.repeat_state {
            self.step();
            return;
        }

        loop {
            let Some(input) = self.input.as_mut() else {
                self.closed = true;
                return;
            };
            match read_msg(input) {
                Ok(Some((msg, header))) => {
                    if let Some(header) = header {
                        self.header = header;
                        self.has_header = true;
                    }
                    self.last_msg = Some(msg);
                }
                Ok(None) => {
                    // The peer exited without sending more; normal end.
                    debug!("no further message before the stream closed, exiting");
                    self.exit_requested = Some(0);
                    return;
                }
                Err(e) => {
                    error!("protocol desync on the message stream: {e}");
                    self.exit_requested = Some(1);
                    return;
                }
            }

            self.want_next_msg = false;
            loop {
                self.step();
                if self.closed || self.outbuf.has_pending() || self.want_next_msg {
                    break;
                }
            }
            if self.closed || self.outbuf.has_pending() {
                return;
            }
        }
    }

    fn step(&mut self) {
        let Some(msg) = self.last_msg else {
            return;
        };
        let before = self.state;
        self.state = match before {
            ShimState::WaitingForHeader => self.on_waiting_for_header(msg),
            ShimState::ReadingPrefix => self.on_reading_prefix(msg),
            ShimState::ReadingExists => self.on_reading_exists(msg),
            ShimState::ReadingForall => self.on_reading_forall(msg),
            ShimState::ReadingMatrix => self.on_reading_matrix(msg),
            ShimState::ReadingClause => self.on_reading_clause(msg),
            ShimState::Working => self.on_working(),
        };
        if before != self.state {
            trace!("state transition from {} to {}", before, self.state);
        } else {
            trace!("state stayed in {}", before);
        }
    }

    fn on_waiting_for_header(&mut self, msg: Message) -> ShimState {
        self.outbuf.push_bytes(b"p cnf ");
        self.outbuf.push_int(self.header.literals);
        self.outbuf.push_byte(b' ');
        self.outbuf.push_int(self.header.clauses);
        self.outbuf.push_byte(b'\n');

        if self.header.literals == 0 {
            self.filler.set(b"0\n");
        }

        match msg {
            Message::Header { api_version } => {
                timing::header();
                if api_version == API_VERSION {
                    debug!("API versions match, both sides use {API_VERSION}");
                } else {
                    error!(
                        "API version mismatch: runtime is {API_VERSION}, application uses \
                         {api_version}; errors may occur"
                    );
                }

                // Tell the driver the preload took effect and reads are
                // wrapped.
                self.send_report(&Message::Started {
                    api_version: API_VERSION,
                });
                ShimState::ReadingPrefix
            }
            other => {
                error!(
                    "received invalid message type {} in state WAITING_FOR_HEADER",
                    other.type_str()
                );
                ShimState::ReadingPrefix
            }
        }
    }

    fn on_reading_prefix(&mut self, msg: Message) -> ShimState {
        timing::msg_after_header();

        match msg {
            Message::Quantifier { lit } if lit > 0 => {
                self.outbuf.push_bytes(b"e ");
                self.outbuf.push_int(lit);
                if self.quantifier_count == 0 {
                    self.filler.seed(lit);
                }
                self.quantifier_count += 1;
                ShimState::ReadingExists
            }
            Message::Quantifier { lit } if lit < 0 => {
                self.outbuf.push_bytes(b"a ");
                self.outbuf.push_int(-lit);
                self.quantifier_count += 1;
                ShimState::ReadingForall
            }
            Message::Quantifier { .. } => {
                error!("received invalid quantifier 0 while READING_PREFIX");
                self.want_next_msg = true;
                ShimState::ReadingPrefix
            }
            Message::Literal { .. } => ShimState::ReadingMatrix,
            Message::Fork {
                wait_for_exit_code_and_report,
            } => {
                self.want_next_msg = true;
                self.fork_solving_child(wait_for_exit_code_and_report);
                ShimState::ReadingPrefix
            }
            Message::Solve => {
                self.repeat_state = true;
                ShimState::ReadingMatrix
            }
            other => {
                error!(
                    "received message of invalid type {} while READING_PREFIX",
                    other.type_str()
                );
                self.want_next_msg = true;
                ShimState::ReadingPrefix
            }
        }
    }

    fn on_reading_exists(&mut self, msg: Message) -> ShimState {
        match msg {
            Message::Quantifier { lit } if lit < 0 => {
                self.outbuf.push_bytes(b" 0\na ");
                self.outbuf.push_int(-lit);
                self.quantifier_count += 1;
                ShimState::ReadingForall
            }
            Message::Quantifier { lit } if lit > 0 => {
                self.outbuf.push_byte(b' ');
                self.outbuf.push_int(lit);
                self.quantifier_count += 1;
                ShimState::ReadingExists
            }
            Message::Quantifier { .. } => {
                self.outbuf.push_bytes(b" 0\n");
                ShimState::ReadingPrefix
            }
            Message::Literal { lit } => {
                self.outbuf.push_bytes(b" 0\n");
                self.outbuf.push_int(lit);
                ShimState::ReadingClause
            }
            other => {
                error!(
                    "received message of invalid type {} while READING_EXISTS",
                    other.type_str()
                );
                self.want_next_msg = true;
                ShimState::ReadingExists
            }
        }
    }

    fn on_reading_forall(&mut self, msg: Message) -> ShimState {
        match msg {
            Message::Quantifier { lit } if lit > 0 => {
                self.outbuf.push_bytes(b" 0\ne ");
                self.outbuf.push_int(lit);
                self.quantifier_count += 1;
                ShimState::ReadingExists
            }
            Message::Quantifier { lit } if lit < 0 => {
                self.outbuf.push_byte(b' ');
                self.outbuf.push_int(-lit);
                self.quantifier_count += 1;
                ShimState::ReadingForall
            }
            Message::Quantifier { .. } => {
                self.outbuf.push_bytes(b" 0\n");
                ShimState::ReadingPrefix
            }
            Message::Literal { lit } => {
                self.outbuf.push_bytes(b" 0\n");
                self.outbuf.push_int(lit);
                ShimState::ReadingClause
            }
            other => {
                error!(
                    "received message of invalid type {} while READING_FORALL",
                    other.type_str()
                );
                self.want_next_msg = true;
                ShimState::ReadingForall
            }
        }
    }

    fn on_reading_matrix(&mut self, msg: Message) -> ShimState {
        match msg {
            Message::Literal { lit } => {
                self.outbuf.push_int(lit);
                if lit == 0 {
                    ShimState::ReadingMatrix
                } else {
                    ShimState::ReadingClause
                }
            }
            Message::Fork {
                wait_for_exit_code_and_report,
            } => {
                self.fork_solving_child(wait_for_exit_code_and_report);
                self.want_next_msg = true;
                ShimState::ReadingMatrix
            }
            Message::Solve => {
                if self.written_clauses < self.header.clauses {
                    debug!(
                        "not enough clauses written: require {}, have {}; emitting filler clause",
                        self.header.clauses, self.written_clauses
                    );
                    let filler = self.filler.bytes().to_owned();
                    self.outbuf.push_bytes(&filler);
                    self.written_clauses += 1;
                    self.repeat_state = true;
                    ShimState::ReadingMatrix
                } else {
                    debug!(
                        "wrote all clauses: require {}, have {}",
                        self.header.clauses, self.written_clauses
                    );
                    self.repeat_state = false;
                    ShimState::Working
                }
            }
            other => {
                error!(
                    "received message of invalid type {} while READING_MATRIX",
                    other.type_str()
                );
                self.want_next_msg = true;
                ShimState::ReadingMatrix
            }
        }
    }

    fn on_reading_clause(&mut self, msg: Message) -> ShimState {
        match msg {
            Message::Literal { lit } => {
                self.outbuf.push_byte(b' ');
                self.outbuf.push_int(lit);
                if lit == 0 {
                    self.outbuf.push_byte(b'\n');
                    self.written_clauses += 1;
                    ShimState::ReadingMatrix
                } else {
                    ShimState::ReadingClause
                }
            }
            other => {
                error!(
                    "received message of invalid type {} while READING_CLAUSE",
                    other.type_str()
                );
                self.want_next_msg = true;
                ShimState::ReadingMatrix
            }
        }
    }

    /// The formula is complete: close the input stream so the solver sees
    /// EOF, and stop re-intercepting reads in processes the solver spawns.
    fn on_working(&mut self) -> ShimState {
        self.input = None;
        if self.input_fd >= 0 {
            // SAFETY: plain close of the inherited stdin descriptor.
            unsafe { libc::close(self.input_fd) };
            std::env::remove_var("LD_PRELOAD");
        }
        self.closed = true;
        ShimState::Working
    }

    fn send_report(&self, msg: &Message) {
        if let Some(fd) = self.report_pipe_fd() {
            let mut writer = FdWriter(fd);
            if let Err(e) = write_msg(&mut writer, msg, None) {
                error!("could not send {} to the driver: {e}", msg.type_str());
            }
        } else {
            error!(
                "cannot send {} to the driver: no header block received yet",
                msg.type_str()
            );
        }
    }

    /// Fork protocol. The child becomes the solver: it rewires stdio to the
    /// pipe pair from the header block and keeps consuming messages (the
    /// assumption literals) in the current state. The parent reports the
    /// fork and optionally waits on the child to report its exit code.
    fn fork_solving_child(&mut self, wait_for_exit_code_and_report: bool) {
        if wait_for_exit_code_and_report {
            // A no-op SIGCHLD handler makes the waitpid below race-free.
            if !SIGCHLD_HANDLER_INSTALLED.swap(true, SeqCst) {
                // SAFETY: installing a no-op handler for SIGCHLD.
                if let Err(e) = unsafe { signal(Signal::SIGCHLD, SigHandler::Handler(sigchld_noop)) }
                {
                    error!("could not install SIGCHLD handler: {e}");
                }
            }
            // The exit code replaces the DESTRUCTED message; the flag is set
            // before forking so the child inherits the suppression.
            SEND_DESTRUCTED.store(false, SeqCst);
        }

        // SAFETY: the runtime is single-threaded at this point; the child
        // continues with the inherited state.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                self.solver_child_pid = Some(child);
                self.send_report(&Message::ForkReport {
                    solver_child_pid: child.as_raw(),
                });
                debug!("fork successful, pid of the solver child: {child}");

                if wait_for_exit_code_and_report {
                    debug!("waiting for the solver child to collect its exit code");
                    let exit_code = match waitpid(child, None) {
                        Ok(WaitStatus::Exited(_, code)) => {
                            debug!("solver child terminated normally");
                            code
                        }
                        Ok(WaitStatus::Signaled(_, Signal::SIGKILL, _)) => 0,
                        Ok(WaitStatus::Signaled(_, sig, _)) => {
                            error!("solver child was terminated by signal {sig}");
                            0
                        }
                        Ok(status) => {
                            error!("unexpected wait status for the solver child: {status:?}");
                            0
                        }
                        Err(e) => {
                            error!("waitpid({child}) for the solver child failed: {e}");
                            0
                        }
                    };
                    debug!("solver child exit code: {exit_code}");
                    self.send_report(&Message::ExitCode { exit_code });
                }
            }
            Ok(ForkResult::Child) => {
                self.solver_child_pid = None;
                self.input = None;

                let stdin_pipe = self.header.forked_child_read_pipe[0];
                let stdout_pipe = self.header.forked_child_write_pipe[1];
                // SAFETY: rewiring inherited descriptors onto stdio.
                unsafe {
                    libc::close(libc::STDIN_FILENO);
                    libc::close(libc::STDOUT_FILENO);
                    if libc::dup2(stdin_pipe, libc::STDIN_FILENO) == -1 {
                        error!(
                            "dup2 of the assumption pipe onto stdin failed: {}",
                            std::io::Error::last_os_error()
                        );
                    }
                    libc::close(stdin_pipe);
                    if libc::dup2(stdout_pipe, libc::STDOUT_FILENO) == -1 {
                        error!(
                            "dup2 of the output pipe onto stdout failed: {}",
                            std::io::Error::last_os_error()
                        );
                    }
                    libc::close(stdout_pipe);
                }

                self.input = MsgInput::open(libc::STDIN_FILENO, &self.syms);
                debug!("forked into the solver child, awaiting assumptions");
            }
            Err(e) => {
                error!("fork of the solver child failed: {e}");
            }
        }
    }
}

extern "C" fn sigchld_noop(_: libc::c_int) {}

#[cfg(test)]
mod tests {
    use super::*;
    use quapi_common::fdio::FdReader;
    use std::os::unix::io::AsRawFd;

    /// Builds a runtime fed from an in-memory message stream, with the
    /// report pipe pointing at a real pipe so STARTED can be asserted.
    fn test_runtime(
        literals: i32,
        clauses: i32,
        prefixdepth: i32,
        msgs: &[Message],
    ) -> (Runtime, std::os::unix::io::OwnedFd) {
        let (report_rx, report_tx) = nix::unistd::pipe().unwrap();
        let header = HeaderData {
            literals,
            clauses: clauses + prefixdepth,
            prefixdepth,
            forked_child_read_pipe: [-1, -1],
            forked_child_write_pipe: [-1, -1],
            message_to_parent_pipe: [-1, report_tx.as_raw_fd()],
        };

        let mut stream = Vec::new();
        write_msg(
            &mut stream,
            &Message::Header {
                api_version: API_VERSION,
            },
            Some(&header),
        )
        .unwrap();
        for msg in msgs {
            write_msg(&mut stream, msg, None).unwrap();
        }

        let mut rt = Runtime::new(OrigSyms::default());
        rt.input = Some(MsgInput::Mem(std::io::Cursor::new(stream)));
        rt.input_fd = -1;
        // report_tx stays open through the returned guard tuple.
        std::mem::forget(report_tx);
        (rt, report_rx)
    }

    /// Drains the whole synthesized stream with an awkward buffer size.
    fn synthesize(rt: &mut Runtime) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 17];
        loop {
            match rt.read(&mut buf) {
                ReadOutcome::Data(0) => break,
                ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::Exit(code) => {
                    assert_eq!(code, 0);
                    break;
                }
            }
        }
        out
    }

    fn lits(seq: &[i32]) -> Vec<Message> {
        seq.iter().map(|&lit| Message::Literal { lit }).collect()
    }

    #[test]
    fn started_is_reported_after_the_header() {
        let (mut rt, report_rx) = test_runtime(1, 1, 0, &lits(&[1, 0]));
        let _ = synthesize(&mut rt);

        let mut reader = FdReader(report_rx.as_raw_fd());
        let (msg, _) = read_msg(&mut reader).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Started {
                api_version: API_VERSION
            }
        );
    }

    #[test]
    fn qbf_with_universal_block_and_assumption() {
        let mut msgs = vec![
            Message::Quantifier { lit: 1 },
            Message::Quantifier { lit: -2 },
        ];
        msgs.extend(lits(&[1, 2, 0, -1, 0]));
        msgs.push(Message::Solve);

        let (mut rt, _report) = test_runtime(2, 1, 1, &msgs);
        let out = synthesize(&mut rt);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "p cnf 2 2\ne 1 0\na 2 0\n1 2 0\n-1 0\n"
        );
    }

    #[test]
    fn single_exists_block_keeps_growing() {
        let mut msgs = vec![
            Message::Quantifier { lit: 1 },
            Message::Quantifier { lit: 2 },
        ];
        msgs.extend(lits(&[1, 2, 3, 0, 1, 0]));
        msgs.push(Message::Solve);

        let (mut rt, _report) = test_runtime(3, 1, 1, &msgs);
        let out = synthesize(&mut rt);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "p cnf 3 2\ne 1 2 0\n1 2 3 0\n1 0\n"
        );
    }

    #[test]
    fn two_assumptions_fill_two_slots() {
        let mut msgs = vec![
            Message::Quantifier { lit: 1 },
            Message::Quantifier { lit: 2 },
        ];
        msgs.extend(lits(&[1, 2, 0, -1, 0, 2, 0]));
        msgs.push(Message::Solve);

        let (mut rt, _report) = test_runtime(2, 1, 2, &msgs);
        let out = synthesize(&mut rt);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "p cnf 2 3\ne 1 2 0\n1 2 0\n-1 0\n2 0\n"
        );
    }

    #[test]
    fn missing_assumptions_are_padded_with_filler() {
        let mut msgs = vec![
            Message::Quantifier { lit: 1 },
            Message::Quantifier { lit: 2 },
        ];
        msgs.extend(lits(&[1, 2, 3, 0, 1, 0]));
        msgs.push(Message::Solve);

        let (mut rt, _report) = test_runtime(3, 1, 2, &msgs);
        let out = synthesize(&mut rt);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "p cnf 3 3\ne 1 2 0\n1 2 3 0\n1 0\n1 -1 0\n"
        );
    }

    #[test]
    fn several_missing_assumptions_pad_repeatedly() {
        let mut msgs = vec![
            Message::Quantifier { lit: 1 },
            Message::Quantifier { lit: 2 },
        ];
        msgs.extend(lits(&[1, 2, 3, 0, 1, 0]));
        msgs.push(Message::Solve);

        let (mut rt, _report) = test_runtime(3, 1, 3, &msgs);
        let out = synthesize(&mut rt);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "p cnf 3 4\ne 1 2 0\n1 2 3 0\n1 0\n1 -1 0\n1 -1 0\n"
        );
    }

    #[test]
    fn zero_variable_formula_uses_the_empty_filler() {
        let msgs = vec![Message::Solve];
        let (mut rt, _report) = test_runtime(0, 0, 1, &msgs);
        let out = synthesize(&mut rt);
        assert_eq!(String::from_utf8(out).unwrap(), "p cnf 0 1\n0\n");
    }

    #[test]
    fn cnf_without_quantifiers_has_no_prefix() {
        let mut msgs = lits(&[1, 2, 0, 2, -3, 0, 1, 0]);
        msgs.push(Message::Solve);

        let (mut rt, _report) = test_runtime(3, 2, 1, &msgs);
        let out = synthesize(&mut rt);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "p cnf 3 3\n1 2 0\n2 -3 0\n1 0\n"
        );
    }

    #[test]
    fn many_alternating_blocks_stress_the_text_path() {
        let mut msgs = Vec::new();
        let mut expected_prefix = String::new();
        for block in 0..3 {
            let (from, to) = (block * 100 + 1, block * 100 + 100);
            let (tag, sign) = if block % 2 == 0 { ("e", 1) } else { ("a", -1) };
            expected_prefix.push_str(tag);
            for var in from..=to {
                msgs.push(Message::Quantifier { lit: sign * var });
                expected_prefix.push_str(&format!(" {var}"));
            }
            expected_prefix.push_str(" 0\n");
        }
        msgs.extend(lits(&[1, 2, 0, -1, 0]));
        msgs.push(Message::Solve);

        let (mut rt, _report) = test_runtime(300, 1, 1, &msgs);
        let out = synthesize(&mut rt);
        let expected = format!("p cnf 300 2\n{expected_prefix}1 2 0\n-1 0\n");
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn eof_without_solve_requests_exit() {
        let msgs = lits(&[1, 0]);
        let (mut rt, _report) = test_runtime(1, 1, 0, &msgs);

        let mut buf = [0u8; 64];
        loop {
            match rt.read(&mut buf) {
                ReadOutcome::Exit(code) => {
                    assert_eq!(code, 0);
                    break;
                }
                ReadOutcome::Data(0) => panic!("stream should end by exit, not by close"),
                ReadOutcome::Data(_) => {}
            }
        }
    }

    #[test]
    fn eof_byte_lands_in_the_callers_buffer() {
        let mut msgs = lits(&[1, 0]);
        msgs.push(Message::Solve);
        let (mut rt, _report) = test_runtime(1, 1, 0, &msgs);
        let _ = synthesize(&mut rt);

        let mut buf = [0u8; 4];
        match rt.read(&mut buf) {
            ReadOutcome::Data(0) => assert_eq!(buf[0], 0xff),
            _ => panic!("expected a zero-length read after WORKING"),
        }
    }

    #[test]
    fn digit_pairs_match_naive_formatting() {
        let mut out = OutBuf::new();
        for value in [
            0,
            1,
            -1,
            9,
            10,
            -10,
            99,
            100,
            -101,
            4096,
            65535,
            -99999,
            1234567,
            i32::MAX,
            -i32::MAX,
        ] {
            out.reset();
            out.push_int(value);
            assert_eq!(
                std::str::from_utf8(&out.buf[..out.len]).unwrap(),
                value.to_string()
            );
        }
    }
}
