// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

use crate::handles::{ForkSide, PipePair};
use crate::preload;
use crate::solve_loop::SolveLoop;
use log::{debug, error};
use nix::sys::eventfd::EventFd;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{execvpe, fork, ForkResult, Pid};
use quapi_common::fdio::FdReader;
use quapi_common::message::{read_msg, write_msg, HeaderData, Message};
use quapi_common::pipe::{writer_from_fd, MsgWriter};
use quapi_common::{env, Error, Result, SolverState, API_VERSION};
use regex::Regex;
use std::ffi::CString;
use std::io::Write;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;

/// Callback applied to every stdout line of the solver child during
/// `solve`. A nonzero return stops output handling and becomes the solve
/// result, like a regex hit would.
pub type StdoutCallback = Box<dyn FnMut(&str) -> i32 + Send>;

/// Static configuration of a solver child.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Executable to run, resolved against PATH.
    pub executable: PathBuf,
    /// Arguments. If the first entry does not repeat the executable path,
    /// the path is prepended as argv[0].
    pub argv: Vec<String>,
    /// Environment for the child; inherits the driver's environment when
    /// unset. `LD_PRELOAD` is prepended either way.
    pub envp: Option<Vec<String>>,
    /// Number of distinct variables in the matrix.
    pub literals: i32,
    /// Declared clause count of the matrix, not counting assumption slots.
    pub clauses: i32,
    /// Maximum number of assumption literals per solve.
    pub prefixdepth: i32,
    /// Regex deciding SAT from a stdout line. Set both regexes or neither.
    pub sat_regex: Option<String>,
    /// Regex deciding UNSAT from a stdout line.
    pub unsat_regex: Option<String>,
    /// Explicit preload object, skipping the usual lookup.
    pub preload_path: Option<PathBuf>,
}

impl SolverConfig {
    pub fn new(
        executable: impl Into<PathBuf>,
        literals: i32,
        clauses: i32,
        prefixdepth: i32,
    ) -> Self {
        SolverConfig {
            executable: executable.into(),
            argv: Vec::new(),
            envp: None,
            literals,
            clauses,
            prefixdepth,
            sat_regex: None,
            unsat_regex: None,
            preload_path: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env<I, S>(mut self, envp: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.envp = Some(envp.into_iter().map(Into::into).collect());
        self
    }

    pub fn regexes(mut self, sat: impl Into<String>, unsat: impl Into<String>) -> Self {
        self.sat_regex = Some(sat.into());
        self.unsat_regex = Some(unsat.into());
        self
    }

    pub fn preload_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.preload_path = Some(path.into());
        self
    }
}

/// Handle for aborting a running `solve` from another thread. Signals the
/// solve loop through an eventfd, so it is lock- and wait-free with respect
/// to the solving thread.
#[derive(Clone)]
pub struct Terminator {
    event: Arc<EventFd>,
}

impl Terminator {
    pub fn terminate(&self) {
        if let Err(e) = self.event.arm() {
            error!("could not signal termination via eventfd: {e}");
        }
    }
}

/// A solver child with incremental assumption support.
///
/// The child is spawned by [`Solver::init`] with the preload object
/// injected, receives the formula as typed messages and is forked once per
/// assumption set. Dropping the solver closes all pipes, which ends the
/// seed child.
pub struct Solver {
    state: SolverState,
    header: HeaderData,
    seed_pid: Pid,
    solver_child_pid: Option<Pid>,

    /// Message stream into the seed child's stdin.
    msg_writer: MsgWriter,
    /// Message stream into the forked solver child (assumptions, SOLVE).
    solverchild_writer: MsgWriter,
    report_fd: OwnedFd,
    solver_stdout_fd: OwnedFd,
    /// Read side of the seed child's stdout. Held so the child never sees a
    /// closed stdout before it forks.
    _seed_stdout_fd: OwnedFd,
    event: Arc<EventFd>,

    re_sat: Option<Regex>,
    re_unsat: Option<Regex>,
    stdout_cb: Option<StdoutCallback>,

    written_clauses: i32,
    written_assumptions: i32,
    written_quantifier_literals: i32,
    universal_prefix_depth: i32,
}

struct ExecContext {
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl Solver {
    /// Spawns the seed child and performs the HEADER / STARTED handshake.
    pub fn init(config: SolverConfig) -> Result<Solver> {
        quapi_common::log::init();

        if config.prefixdepth < 0 {
            return Err(Error::Parameter("prefixdepth must not be negative".into()));
        }
        if config.sat_regex.is_some() != config.unsat_regex.is_some() {
            return Err(Error::Parameter(
                "either both SAT and UNSAT regexes are set, or neither".into(),
            ));
        }

        let preload_path = preload::find_preload_object(config.preload_path.as_deref())?;
        debug!("using preload object {}", preload_path.display());

        let (re_sat, re_unsat) = match (&config.sat_regex, &config.unsat_regex) {
            (Some(sat), Some(unsat)) => (Some(compile_regex(sat)?), Some(compile_regex(unsat)?)),
            _ => (None, None),
        };

        // Pipe layout: the seed child reads messages on stdin and keeps its
        // stdout; the remaining three pairs are passed down in the header
        // block for the forked solver child and the report channel.
        let mut seed_stdin = PipePair::new(ForkSide::Child, ForkSide::Parent)?;
        let mut seed_stdout = PipePair::new(ForkSide::Parent, ForkSide::Child)?;
        let mut forked_child_read = PipePair::new(ForkSide::Child, ForkSide::Parent)?;
        let mut forked_child_write = PipePair::new(ForkSide::Parent, ForkSide::Child)?;
        let mut report = PipePair::new(ForkSide::Parent, ForkSide::Child)?;

        set_nonblocking(forked_child_write.read.raw())?;

        let header = HeaderData {
            literals: config.literals,
            clauses: config.clauses + config.prefixdepth,
            prefixdepth: config.prefixdepth,
            forked_child_read_pipe: forked_child_read.fds(),
            forked_child_write_pipe: forked_child_write.fds(),
            message_to_parent_pipe: report.fds(),
        };

        let event = EventFd::new()
            .map_err(|e| Error::other(format!("could not create eventfd: {e}")))?;

        let exec = build_exec_context(&config, &preload_path)?;

        // SAFETY: the child branch only calls async-signal-safe functions
        // plus exec; the driver is effectively single-threaded here.
        let seed_pid = match unsafe { fork() }
            .map_err(|e| Error::other(format!("fork of seed child failed: {e}")))?
        {
            ForkResult::Child => {
                seed_stdin.apply_fork_side(ForkSide::Child);
                seed_stdout.apply_fork_side(ForkSide::Child);
                forked_child_read.apply_fork_side(ForkSide::Child);
                forked_child_write.apply_fork_side(ForkSide::Child);
                report.apply_fork_side(ForkSide::Child);
                exec_seed_child(&exec, &mut seed_stdin, &mut seed_stdout)
            }
            ForkResult::Parent { child } => child,
        };

        debug!("forked seed child with pid {seed_pid}");

        seed_stdin.apply_fork_side(ForkSide::Parent);
        seed_stdout.apply_fork_side(ForkSide::Parent);
        forked_child_read.apply_fork_side(ForkSide::Parent);
        forked_child_write.apply_fork_side(ForkSide::Parent);
        report.apply_fork_side(ForkSide::Parent);

        let mut msg_writer = writer_from_fd(seed_stdin.write.take()?)?;
        let solverchild_writer = writer_from_fd(forked_child_read.write.take()?)?;
        let report_fd = report.read.take()?;
        let solver_stdout_fd = forked_child_write.read.take()?;
        let seed_stdout_fd = seed_stdout.read.take()?;

        write_msg(
            &mut msg_writer,
            &Message::Header {
                api_version: API_VERSION,
            },
            Some(&header),
        )?;

        // The runtime answers STARTED once it wrapped the first read; this
        // confirms the preload took effect.
        let mut report_reader = FdReader(report_fd.as_raw_fd());
        match read_msg(&mut report_reader)? {
            Some((Message::Started { api_version }, _)) => {
                if api_version != API_VERSION {
                    error!(
                        "API version mismatch: driver uses {API_VERSION}, runtime reported \
                         {api_version}; errors may occur"
                    );
                }
            }
            Some((other, _)) => {
                return Err(Error::other(format!(
                    "expected STARTED from the seed child, got {}",
                    other.type_str()
                )));
            }
            None => {
                return Err(Error::other(
                    "seed child closed the report pipe before sending STARTED",
                ));
            }
        }

        Ok(Solver {
            state: SolverState::Input,
            header,
            seed_pid,
            solver_child_pid: None,
            msg_writer,
            solverchild_writer,
            report_fd,
            solver_stdout_fd,
            _seed_stdout_fd: seed_stdout_fd,
            event: Arc::new(event),
            re_sat,
            re_unsat,
            stdout_cb: None,
            written_clauses: 0,
            written_assumptions: 0,
            written_quantifier_literals: 0,
            universal_prefix_depth: -1,
        })
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn seed_child_pid(&self) -> i32 {
        self.seed_pid.as_raw()
    }

    /// Returns a handle that may abort `solve` from any thread.
    pub fn terminator(&self) -> Terminator {
        Terminator {
            event: Arc::clone(&self.event),
        }
    }

    /// Registers a callback for every stdout line of the solver child. Once
    /// it returns nonzero, output handling stops and the value becomes the
    /// solve result. Works independently of the regex configuration.
    pub fn set_stdout_callback<F>(&mut self, cb: F)
    where
        F: FnMut(&str) -> i32 + Send + 'static,
    {
        self.stdout_cb = Some(Box::new(cb));
    }

    /// Extends the quantifier prefix. Positive literals quantify
    /// existentially, negative ones universally; `0` terminates the prefix.
    pub fn quantify(&mut self, lit: i32) -> Result<()> {
        if self.state != SolverState::Input {
            return Err(Error::InvalidSolverState {
                operation: "quantify",
                state: self.state,
            });
        }
        let mut lit = check_literal_range(lit)?;

        if lit < 0 && self.written_quantifier_literals < self.header.prefixdepth {
            self.universal_prefix_depth = self.written_quantifier_literals;
        }
        if lit < 0 && self.header.prefixdepth > self.written_quantifier_literals {
            // A universal inside the assumption window would make the padded
            // formula invalid; it is promoted to an existential.
            lit = -lit;
        }

        write_msg(&mut self.msg_writer, &Message::Quantifier { lit }, None)?;

        if lit != 0 {
            self.written_quantifier_literals += 1;
        }
        Ok(())
    }

    /// Adds a literal to the current clause, or finalizes the clause with
    /// `0`.
    pub fn add(&mut self, lit: i32) -> Result<()> {
        if !matches!(
            self.state,
            SolverState::Input | SolverState::InputLiterals
        ) {
            return Err(Error::InvalidSolverState {
                operation: "add",
                state: self.state,
            });
        }
        let lit = check_literal_range(lit)?;

        self.state = SolverState::InputLiterals;
        write_msg(&mut self.msg_writer, &Message::Literal { lit }, None)?;

        if lit == 0 {
            self.written_clauses += 1;
        }
        Ok(())
    }

    /// Forks the solver child if it does not exist yet. The forked child
    /// waits for assumption literals on its own pipe.
    fn make_solvable(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            SolverState::Input | SolverState::InputLiterals
        ) {
            return Ok(());
        }
        self.state = SolverState::InputAssumptions;

        // Without a regex to match against, the result is the solver's exit
        // code; the seed child then waits on the fork and reports it.
        write_msg(
            &mut self.msg_writer,
            &Message::Fork {
                wait_for_exit_code_and_report: self.re_sat.is_none(),
            },
            None,
        )?;

        let mut reader = FdReader(self.report_fd.as_raw_fd());
        loop {
            match read_msg(&mut reader)? {
                Some((Message::ForkReport { solver_child_pid }, _)) => {
                    debug!("solver child has pid {solver_child_pid}");
                    self.solver_child_pid = Some(Pid::from_raw(solver_child_pid));
                    return Ok(());
                }
                Some((other, _)) => {
                    debug!(
                        "ignoring {} while waiting for FORK REPORT",
                        other.type_str()
                    );
                }
                None => {
                    return Err(Error::other(
                        "seed child closed the report pipe before FORK REPORT",
                    ));
                }
            }
        }
    }

    /// Adds an assumption for the next solve. Internally appends a unit
    /// clause to the formula of the already forked solver child. `0` is a
    /// no-op.
    pub fn assume(&mut self, lit: i32) -> Result<()> {
        if !matches!(
            self.state,
            SolverState::InputLiterals | SolverState::InputAssumptions
        ) {
            return Err(Error::InvalidSolverState {
                operation: "assume",
                state: self.state,
            });
        }
        if lit == 0 {
            return Ok(());
        }
        let lit = check_literal_range(lit)?;

        if self.written_clauses >= self.header.clauses {
            error!(
                "no assumption slot left for literal {lit}: written_clauses={} reached the \
                 declared total of {} ({} matrix clauses + prefixdepth {})",
                self.written_clauses,
                self.header.clauses,
                self.header.clauses - self.header.prefixdepth,
                self.header.prefixdepth
            );
            return Err(Error::Parameter(format!(
                "assumption {lit} exceeds the reserved prefixdepth of {}",
                self.header.prefixdepth
            )));
        }

        self.make_solvable()?;
        self.state = SolverState::InputAssumptions;

        write_msg(&mut self.solverchild_writer, &Message::Literal { lit }, None)?;
        write_msg(&mut self.solverchild_writer, &Message::Literal { lit: 0 }, None)?;
        // Flushed per assumption: literals still sitting in the buffer when
        // reset_assumptions kills the child would otherwise leak into the
        // next forked child.
        self.solverchild_writer.flush().map_err(Error::Write)?;

        self.written_clauses += 1;
        self.written_assumptions += 1;
        Ok(())
    }

    /// Solves under the current assumptions. Returns 10 for SAT, 20 for
    /// UNSAT and 0 for unknown or aborted; without regexes the solver's
    /// exit code (or a nonzero stdout-callback result) is passed through.
    /// Afterwards the assumptions are cleared and the solver accepts new
    /// clauses and assumptions.
    pub fn solve(&mut self) -> i32 {
        if self.written_assumptions < self.universal_prefix_depth
            && !env::allow_missing_universal_assumptions()
        {
            error!(
                "not enough assumptions to assign all leading universal quantifiers: the \
                 universal prefix goes up to length {}, the maximum assumption count is {} and \
                 only {} assumptions were applied; set {} to allow this",
                self.universal_prefix_depth,
                self.header.prefixdepth,
                self.written_assumptions,
                env::ENV_ALLOW_MISSING_UNIVERSAL_ASSUMPTIONS
            );
            return 0;
        }

        if let Err(e) = self.make_solvable() {
            error!("could not fork the solver child: {e}");
            return 0;
        }

        let retcode = self.solve_inner();

        self.state = SolverState::InputLiterals;
        self.written_clauses -= self.written_assumptions;
        self.written_assumptions = 0;
        retcode
    }

    fn solve_inner(&mut self) -> i32 {
        self.state = SolverState::Working;

        if let Err(e) = write_msg(&mut self.solverchild_writer, &Message::Solve, None) {
            error!("could not send SOLVE to the solver child: {e}");
            return 0;
        }

        SolveLoop {
            report_fd: self.report_fd.as_raw_fd(),
            event_fd: self.event.as_fd().as_raw_fd(),
            stdout_fd: self.solver_stdout_fd.as_raw_fd(),
            watch_stdout: self.re_sat.is_some() || self.stdout_cb.is_some(),
            re_sat: self.re_sat.as_ref(),
            re_unsat: self.re_unsat.as_ref(),
            stdout_cb: self.stdout_cb.as_mut(),
            solver_child: self.solver_child_pid,
            line_buf: Vec::new(),
            retcode: 0,
        }
        .run()
    }

    /// Kills the solver child and rewinds the assumption counters, so a new
    /// assumption set can be applied to the same formula.
    pub fn reset_assumptions(&mut self) {
        if self.state != SolverState::InputAssumptions {
            return;
        }
        if let Some(pid) = self.solver_child_pid.take() {
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                error!("could not kill solver child {pid}: {e}");
            }
            let _ = waitpid(pid, None);
        }
        self.written_clauses -= self.written_assumptions;
        self.written_assumptions = 0;
        self.state = SolverState::InputLiterals;
    }
}

fn check_literal_range(lit: i32) -> Result<i32> {
    if lit == i32::MIN {
        return Err(Error::Parameter(
            "i32::MIN is not a valid literal, its negation overflows".into(),
        ));
    }
    Ok(lit)
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::Parameter(format!("could not compile regex \"{pattern}\": {e}")))
}

fn set_nonblocking(fd: std::os::unix::io::RawFd) -> Result<()> {
    // SAFETY: fd is a valid open descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(Error::other(format!(
            "fcntl(F_GETFL) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(Error::other(format!(
            "could not set solver child stdout to O_NONBLOCK: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn build_exec_context(config: &SolverConfig, preload_path: &std::path::Path) -> Result<ExecContext> {
    let path_str = config.executable.to_string_lossy().into_owned();
    let path = cstring(&path_str)?;

    let mut argv = Vec::with_capacity(config.argv.len() + 1);
    if config.argv.first().map(String::as_str) != Some(path_str.as_str()) {
        argv.push(path.clone());
    }
    for arg in &config.argv {
        argv.push(cstring(arg)?);
    }

    let env_source: Vec<String> = match &config.envp {
        Some(envp) => envp.clone(),
        None => std::env::vars_os()
            .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
            .collect(),
    };
    let mut envp = Vec::with_capacity(env_source.len() + 1);
    envp.push(cstring(&format!(
        "LD_PRELOAD={}",
        preload_path.display()
    ))?);
    for entry in &env_source {
        envp.push(cstring(entry)?);
    }

    Ok(ExecContext { path, argv, envp })
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| {
        Error::Parameter(format!("string \"{s}\" contains an interior NUL byte"))
    })
}

/// Child branch of the init fork: wires stdio to the driver pipes and execs
/// the solver with the preload object injected.
fn exec_seed_child(exec: &ExecContext, seed_stdin: &mut PipePair, seed_stdout: &mut PipePair) -> ! {
    // SAFETY: plain dup2/close/_exit calls on inherited descriptors.
    unsafe {
        if libc::dup2(seed_stdin.read.raw(), libc::STDIN_FILENO) == -1 {
            error!(
                "dup2 onto stdin failed in seed child: {}",
                std::io::Error::last_os_error()
            );
            libc::_exit(1);
        }
        if libc::dup2(seed_stdout.write.raw(), libc::STDOUT_FILENO) == -1 {
            error!(
                "dup2 onto stdout failed in seed child: {}",
                std::io::Error::last_os_error()
            );
            libc::_exit(1);
        }
    }
    // The originals were moved onto fds 0/1.
    drop(seed_stdin.read.take());
    drop(seed_stdout.write.take());

    let _ = execvpe(&exec.path, &exec.argv, &exec.envp);
    error!(
        "execvpe of {:?} failed: {}",
        exec.path,
        std::io::Error::last_os_error()
    );
    // SAFETY: _exit is always safe.
    unsafe { libc::_exit(1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_pair_must_be_complete() {
        let mut config = SolverConfig::new("/bin/true", 1, 1, 1);
        config.sat_regex = Some("SAT".into());
        assert!(matches!(
            Solver::init(config),
            Err(Error::Parameter(_))
        ));
    }

    #[test]
    fn negative_prefixdepth_is_rejected() {
        let config = SolverConfig::new("/bin/true", 1, 1, -1);
        assert!(matches!(Solver::init(config), Err(Error::Parameter(_))));
    }

    #[test]
    fn literal_range_guard() {
        assert!(check_literal_range(i32::MIN).is_err());
        assert_eq!(check_literal_range(i32::MAX).unwrap(), i32::MAX);
        assert_eq!(check_literal_range(-5).unwrap(), -5);
    }

    #[test]
    fn argv_zero_is_normalized() {
        let config = SolverConfig::new("/bin/echo", 1, 1, 0).args(["hello"]);
        let ctx = build_exec_context(&config, std::path::Path::new("/tmp/lib.so")).unwrap();
        assert_eq!(ctx.argv[0].to_str().unwrap(), "/bin/echo");
        assert_eq!(ctx.argv[1].to_str().unwrap(), "hello");

        let config = SolverConfig::new("/bin/echo", 1, 1, 0).args(["/bin/echo", "hello"]);
        let ctx = build_exec_context(&config, std::path::Path::new("/tmp/lib.so")).unwrap();
        assert_eq!(ctx.argv.len(), 2);
        assert_eq!(ctx.argv[0].to_str().unwrap(), "/bin/echo");
    }

    #[test]
    fn ld_preload_is_prepended() {
        let config = SolverConfig::new("/bin/echo", 1, 1, 0).env(["FOO=bar"]);
        let ctx = build_exec_context(&config, std::path::Path::new("/tmp/lib.so")).unwrap();
        assert_eq!(ctx.envp[0].to_str().unwrap(), "LD_PRELOAD=/tmp/lib.so");
        assert_eq!(ctx.envp[1].to_str().unwrap(), "FOO=bar");
    }
}
