//! Line-protocol session with the ebus gateway daemon (ebusd).
//!
//! - Blocking TCP, one request line and one (or a few) answer lines per exchange.
//! - Reads share one long-lived connection per batch; writes dial their own short-lived one.
//! - Transient `ERR:` answers are retried under a bounded [`RetryPolicy`].

use log::{debug, warn};
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

pub const ERR_PREFIX: &str = "ERR:";
pub const ERR_INVALID_POSITION: &str = "ERR: invalid position in decode";
pub const ERR_ELEMENT_NOT_FOUND: &str = "ERR: element not found";
pub const ERR_NO_SIGNAL: &str = "ERR: no signal";

pub const DEFAULT_READ_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum EbusError {
    /// Dial, send or receive failed.
    Transport { context: String, source: io::Error },
    /// Handshake answer was empty or malformed.
    Protocol(String),
    /// The daemon does not know one or more named values.
    ElementNotFound { names: Vec<String>, report: String },
}

impl EbusError {
    pub(crate) fn transport(context: impl Into<String>, source: io::Error) -> Self {
        EbusError::Transport {
            context: context.into(),
            source,
        }
    }
}

impl core::fmt::Display for EbusError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EbusError::Transport { context, source } => write!(f, "transport error ({}): {}", context, source),
            EbusError::Protocol(s) => write!(f, "protocol error: {}", s),
            EbusError::ElementNotFound { names, .. } => {
                write!(f, "{} named value(s) answered {:?}: {}", names.len(), ERR_ELEMENT_NOT_FOUND, names.join(", "))
            }
        }
    }
}

impl std::error::Error for EbusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EbusError::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// What one attempt of a retried operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// Final answer, stop retrying.
    Done(T),
    /// Transient answer; retried unless attempts are exhausted, in which case it is returned.
    Retry(T),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed pause before every retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_READ_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Run `op` (called with the 1-based attempt number) until it is done, fails, or attempts run out.
    pub fn run<T, E>(&self, mut op: impl FnMut(u32) -> Result<Attempt<T>, E>) -> Result<T, E> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt)? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(value) if attempt >= max_attempts => return Ok(value),
                Attempt::Retry(_) => {
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Whether an I/O error means the peer went away (as opposed to, say, a timeout).
pub fn is_closed_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn is_error_answer(answer: &str) -> bool {
    answer.starts_with(ERR_PREFIX)
}

/// Answers that will not change by asking again.
fn is_definitive_error(answer: &str) -> bool {
    answer == ERR_INVALID_POSITION || answer == ERR_ELEMENT_NOT_FOUND
}

pub fn read_command(name: &str, max_age_secs: Option<u32>) -> String {
    match max_age_secs {
        Some(age) => format!("read -m {} {}", age, name),
        None => format!("read {}", name),
    }
}

struct Link {
    reader: BufReader<TcpStream>,
}

impl Link {
    fn dial(address: &str, timeout: Option<Duration>) -> io::Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(Link {
            reader: BufReader::new(stream),
        })
    }

    fn send(&mut self, line: &str) -> io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()
    }

    /// One line including its terminator; EOF is reported as `UnexpectedEof`.
    fn recv_raw(&mut self) -> io::Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by ebusd"));
        }
        Ok(line)
    }

    fn recv(&mut self) -> io::Result<String> {
        self.recv_raw().map(|l| l.trim().to_string())
    }
}

pub struct GatewaySession {
    address: String,
    io_timeout: Option<Duration>,
    retry: RetryPolicy,
    link: Option<Link>,
}

impl GatewaySession {
    pub fn new(address: impl Into<String>, retry: RetryPolicy, io_timeout: Option<Duration>) -> Self {
        GatewaySession {
            address: address.into(),
            io_timeout,
            retry,
            link: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Start a batch on a freshly dialled connection.
    pub fn open(&mut self) -> Result<(), EbusError> {
        let link = Link::dial(&self.address, self.io_timeout)
            .map_err(|e| EbusError::transport(format!("connect {}", self.address), e))?;
        self.link = Some(link);
        Ok(())
    }

    /// Drop the batch connection, if any.
    pub fn close(&mut self) {
        self.link = None;
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn link(&mut self) -> Result<&mut Link, EbusError> {
        let link = match self.link.take() {
            Some(l) => l,
            None => Link::dial(&self.address, self.io_timeout)
                .map_err(|e| EbusError::transport(format!("connect {}", self.address), e))?,
        };
        Ok(self.link.insert(link))
    }

    /// Collect the `scan result` listing, up to its terminating blank line.
    pub fn scan(&mut self) -> Result<String, EbusError> {
        let link = self.link()?;
        link.send("scan result")
            .map_err(|e| EbusError::transport("send scan result", e))?;

        let mut listing = String::new();
        loop {
            match link.recv_raw() {
                Ok(line) if line.trim().is_empty() => break,
                Ok(line) => listing.push_str(&line),
                Err(e) => {
                    debug!("scan result ended early: {}", e);
                    break;
                }
            }
        }

        if listing.trim().is_empty() {
            return Err(EbusError::Protocol("empty scan result from ebusd".to_string()));
        }
        Ok(listing)
    }

    /// Ask which controller owns `name`; the first token of the `find` answer.
    pub fn find_controller_for(&mut self, name: &str) -> Result<String, EbusError> {
        let link = self.link()?;
        link.send(&format!("find {}", name))
            .map_err(|e| EbusError::transport(format!("send find {}", name), e))?;
        let answer = link
            .recv()
            .map_err(|e| EbusError::transport(format!("receive find {}", name), e))?;

        if is_error_answer(&answer) {
            return Err(EbusError::Protocol(format!("find {}: ebusd answered {}", name, answer)));
        }
        match answer.split_whitespace().next() {
            Some(token) => Ok(token.to_string()),
            None => Err(EbusError::Protocol(format!("empty answer to find {}", name))),
        }
    }

    fn exchange_once(&mut self, command: &str) -> io::Result<String> {
        let link = match self.link.take() {
            Some(l) => l,
            None => Link::dial(&self.address, self.io_timeout)?,
        };
        let link = self.link.insert(link);
        link.send(command)?;
        link.recv()
    }

    /// Send one command and receive one line.
    ///
    /// If the daemon dropped the connection, redial and resend, unless `reconnected` says that
    /// already happened for this call.
    fn exchange(&mut self, command: &str, reconnected: &mut bool) -> Result<String, EbusError> {
        match self.exchange_once(command) {
            Ok(answer) => Ok(answer),
            Err(e) if is_closed_connection(&e) && !*reconnected => {
                *reconnected = true;
                debug!("Connection to ebusd closed ({}); reconnecting for '{}'", e, command);
                self.close();
                self.open()?;
                self.exchange_once(command)
                    .map_err(|e| EbusError::transport(format!("'{}' after reconnect", command), e))
            }
            Err(e) => {
                self.close();
                Err(EbusError::transport(format!("'{}'", command), e))
            }
        }
    }

    /// ebusd follows every `ERR:` line with an extra blank line.
    fn drain_error_trailer(&mut self) {
        if let Some(link) = self.link.as_mut()
            && let Err(e) = link.recv_raw()
        {
            debug!("Could not drain line after ebusd error: {}", e);
        }
    }

    /// Read a named value.
    ///
    /// Transport failures are errors. Daemon errors are not: after retries an `ERR:` answer is
    /// returned verbatim, except `ERR: invalid position in decode`, which becomes `""`.
    pub fn read(&mut self, name: &str, max_age_secs: Option<u32>) -> Result<String, EbusError> {
        let command = read_command(name, max_age_secs);
        let retry = self.retry;
        let mut reconnected = false;

        let answer = retry.run(|attempt| {
            let answer = self.exchange(&command, &mut reconnected)?;
            if !is_error_answer(&answer) {
                return Ok(Attempt::Done(answer));
            }
            self.drain_error_trailer();
            if is_definitive_error(&answer) {
                Ok(Attempt::Done(answer))
            } else {
                debug!("Read try {} of '{}': ebusd answered {}", attempt, command, answer);
                Ok(Attempt::Retry(answer))
            }
        })?;

        if answer == ERR_INVALID_POSITION {
            debug!("'{}' not decodable on this bus; treating as empty", name);
            return Ok(String::new());
        }
        if is_error_answer(&answer) {
            debug!("Command '{}': ebusd answered {}", command, answer);
        }
        Ok(answer)
    }

    /// Send `write <message>` on its own connection and return the acknowledgement line.
    pub fn write(&mut self, message: &str) -> Result<String, EbusError> {
        let command = format!("write {}", message);
        let mut link = Link::dial(&self.address, self.io_timeout)
            .map_err(|e| EbusError::transport(format!("connect {} for write", self.address), e))?;
        link.send(&command)
            .map_err(|e| EbusError::transport(format!("send '{}'", command), e))?;
        let ack = link
            .recv()
            .map_err(|e| EbusError::transport(format!("acknowledgement of '{}'", command), e))?;

        debug!("Command sent to ebusd: {}", command);
        if is_error_answer(&ack) {
            warn!("ebusd rejected '{}': {}", command, ack);
        } else {
            debug!("ebusd answered: {}", ack);
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::FakeDaemon;
    use std::cell::Cell;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn session_for(daemon: &FakeDaemon) -> GatewaySession {
        GatewaySession::new(daemon.address(), quick_retry(), Some(Duration::from_secs(5)))
    }

    #[test]
    fn retry_policy_stops_on_done() {
        let calls = Cell::new(0);
        let out: Result<&str, ()> = quick_retry().run(|_| {
            calls.set(calls.get() + 1);
            Ok(Attempt::Done("ok"))
        });
        assert_eq!(out, Ok("ok"));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_policy_returns_last_transient_value() {
        let out: Result<u32, ()> = quick_retry().run(|attempt| Ok(Attempt::Retry(attempt)));
        assert_eq!(out, Ok(3));
    }

    #[test]
    fn retry_policy_propagates_errors() {
        let calls = Cell::new(0);
        let out: Result<(), &str> = quick_retry().run(|_| {
            calls.set(calls.get() + 1);
            Err("down")
        });
        assert_eq!(out, Err("down"));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn read_command_formats_max_age() {
        assert_eq!(read_command("HwcStorageTemp", Some(60)), "read -m 60 HwcStorageTemp");
        assert_eq!(read_command("HwcOpMode", None), "read HwcOpMode");
    }

    #[test]
    fn closed_connection_signatures() {
        assert!(is_closed_connection(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_closed_connection(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_closed_connection(&io::Error::from(io::ErrorKind::TimedOut)));
    }

    #[test]
    fn reads_plain_value() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcOpMode", "auto");
        let mut session = session_for(&daemon);
        assert_eq!(session.read("HwcOpMode", None).expect("read"), "auto");
        assert_eq!(session.read("HwcOpMode", Some(60)).expect("read"), "auto");
    }

    #[test]
    fn invalid_position_reads_as_empty() {
        let daemon = FakeDaemon::start();
        daemon.set_value("Status01", "ok");
        daemon.script("z3RoomTemp", &[ERR_INVALID_POSITION]);
        let mut session = session_for(&daemon);
        assert_eq!(session.read("z3RoomTemp", None).expect("read"), "");
        // trailer was drained: the next answer belongs to the next command
        assert_eq!(session.read("Status01", None).expect("read"), "ok");
    }

    #[test]
    fn transient_errors_give_up_after_three_attempts() {
        let daemon = FakeDaemon::start();
        daemon.set_value("State", "ready");
        daemon.script("outsidetemp", &[ERR_NO_SIGNAL, ERR_NO_SIGNAL, ERR_NO_SIGNAL, "7.5"]);
        let mut session = session_for(&daemon);

        assert_eq!(session.read("outsidetemp", None).expect("read"), ERR_NO_SIGNAL);
        assert_eq!(daemon.reads_of("outsidetemp"), 3);
        assert_eq!(session.read("State", None).expect("read"), "ready");
    }

    #[test]
    fn transient_error_recovers_on_retry() {
        let daemon = FakeDaemon::start();
        daemon.set_value("WaterPressure", "1.7");
        daemon.script("WaterPressure", &[ERR_NO_SIGNAL]);
        let mut session = session_for(&daemon);
        assert_eq!(session.read("WaterPressure", None).expect("read"), "1.7");
        assert_eq!(daemon.reads_of("WaterPressure"), 2);
    }

    #[test]
    fn element_not_found_is_returned_without_retry() {
        let daemon = FakeDaemon::start();
        let mut session = session_for(&daemon);
        assert_eq!(session.read("NoSuchValue", None).expect("read"), ERR_ELEMENT_NOT_FOUND);
        assert_eq!(daemon.reads_of("NoSuchValue"), 1);
    }

    #[test]
    fn reconnects_once_after_daemon_drops_connection() {
        let daemon = FakeDaemon::start();
        daemon.set_value("HwcTempDesired", "50");
        let mut session = session_for(&daemon);
        assert_eq!(session.read("HwcTempDesired", None).expect("first read"), "50");

        daemon.drop_connections();
        assert_eq!(session.read("HwcTempDesired", None).expect("read after drop"), "50");
    }

    #[test]
    fn read_reconnects_at_most_once() {
        let daemon = FakeDaemon::start();
        daemon.hang_up_after_answer(true);
        daemon.script("outsidetemp", &[ERR_NO_SIGNAL, ERR_NO_SIGNAL, ERR_NO_SIGNAL]);
        let mut session = session_for(&daemon);

        // attempt 1 dials, attempt 2 redials once, attempt 3 finds the link closed again
        assert!(matches!(session.read("outsidetemp", None), Err(EbusError::Transport { .. })));
        assert_eq!(daemon.connections(), 2);
        assert_eq!(daemon.reads_of("outsidetemp"), 2);
        assert!(!session.is_open());
    }

    #[test]
    fn empty_scan_is_protocol_error() {
        let daemon = FakeDaemon::start();
        daemon.empty_scan(true);
        let mut session = session_for(&daemon);
        assert!(matches!(session.scan(), Err(EbusError::Protocol(_))));
    }

    #[test]
    fn unreachable_daemon_is_transport_error() {
        let daemon = FakeDaemon::start();
        let address = daemon.address();
        drop(daemon);
        let mut session = GatewaySession::new(address, quick_retry(), Some(Duration::from_secs(1)));
        assert!(matches!(session.read("HwcOpMode", None), Err(EbusError::Transport { .. })));
        assert!(matches!(session.write("-c 15 HwcSFMode load"), Err(EbusError::Transport { .. })));
    }

    #[test]
    fn handshake_scan_and_find() {
        let daemon = FakeDaemon::start();
        let mut session = session_for(&daemon);
        let listing = session.scan().expect("scan");
        assert!(listing.contains(daemon.controller()));
        assert_eq!(session.find_controller_for("HwcSFMode").expect("find"), daemon.controller());
    }

    #[test]
    fn find_of_unknown_value_is_protocol_error() {
        let daemon = FakeDaemon::start();
        daemon.remove_value("HwcSFMode");
        let mut session = session_for(&daemon);
        assert!(matches!(session.find_controller_for("HwcSFMode"), Err(EbusError::Protocol(_))));
    }

    #[test]
    fn write_uses_separate_connection() {
        let daemon = FakeDaemon::start();
        let mut session = session_for(&daemon);
        assert_eq!(session.read("HwcSFMode", None).expect("read"), "auto");
        let ack = session.write("-c 15 HwcSFMode load").expect("write");
        assert_eq!(ack, "done");
        assert_eq!(daemon.writes(), vec!["-c 15 HwcSFMode load".to_string()]);
        // batch connection untouched by the write
        assert!(session.is_open());
        assert_eq!(session.read("HwcSFMode", None).expect("read"), "load");
    }
}
