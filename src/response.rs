//! Relaying a backend reply until it is provably complete.
//!
//! Replies carry no overall length, so completion is inferred from marker
//! packets. Each command maps to one [`ResponseShape`], and a
//! [`ResponseTracker`] for that shape watches the relayed packets one at a
//! time. The tracker is pure, so the same logic drives [`relay_response`] and
//! the unit tests.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    byte_order::read_le_u16_at,
    command::Command,
    metrics::{self, Direction},
    packet::Packet,
    relay::{PacketIo, Peer, Phase, RelayError, recv, send},
};

/// How the backend replies to a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseShape {
    /// OK, ERR, or a result set of column definitions and rows, each block
    /// ended by EOF. Also used for commands without dedicated handling.
    Query,
    /// The session ends; nothing is forwarded and no reply is expected.
    Quit,
    /// Column definitions until EOF or ERR.
    FieldList,
    /// Exactly one reply packet.
    SingleFrame,
    /// The backend sends nothing back.
    NoReply,
    /// Prepare OK followed by optional parameter and column blocks.
    StmtPrepare,
    /// OK, ERR, or a binary result set.
    StmtExecute,
    /// Rows from an open cursor until EOF or ERR.
    RowFetch,
}

impl ResponseShape {
    /// Reply shape for `command`.
    #[must_use]
    pub fn for_command(command: Command) -> Self {
        match command {
            Command::Quit => Self::Quit,
            Command::FieldList => Self::FieldList,
            Command::Statistics | Command::ChangeUser | Command::StmtReset | Command::SetOption => {
                Self::SingleFrame
            }
            Command::StmtClose | Command::StmtSendLongData => Self::NoReply,
            Command::StmtPrepare => Self::StmtPrepare,
            Command::StmtExecute => Self::StmtExecute,
            Command::StmtFetch => Self::RowFetch,
            _ => Self::Query,
        }
    }

    /// Whether the backend sends any reply at all.
    #[must_use]
    pub fn expects_reply(self) -> bool { !matches!(self, Self::Quit | Self::NoReply) }
}

/// Outcome of observing one reply packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// More packets belong to this reply.
    Continue,
    /// The reply is complete.
    Complete,
    /// The backend asked for a client-side file. The request must not reach
    /// the client; the caller declines it and the tracker is complete.
    LocalInfile,
}

/// `ER_NOT_ALLOWED_COMMAND`, returned in place of a local file request.
const ER_NOT_ALLOWED_COMMAND: u16 = 1148;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    /// Waiting for the first packet of a (possibly further) result.
    First,
    /// Inside a block sequence; this many EOF markers are still due.
    Blocks(u8),
    Done,
}

/// Tracks one reply and reports when it is complete.
///
/// # Examples
///
/// ```
/// use umyproxy::{
///     command::Command,
///     packet::Packet,
///     response::{Progress, ResponseShape, ResponseTracker},
/// };
///
/// let mut tracker = ResponseTracker::new(ResponseShape::for_command(Command::Query));
/// let ok = Packet::new(1, vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
/// assert_eq!(tracker.observe(&ok), Progress::Complete);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct ResponseTracker {
    shape: ResponseShape,
    stage: Stage,
}

impl ResponseTracker {
    /// Tracker for a reply of `shape`.
    #[must_use]
    pub fn new(shape: ResponseShape) -> Self {
        let stage = if shape.expects_reply() { Stage::First } else { Stage::Done };
        Self { shape, stage }
    }

    /// Whether the reply is already complete.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.stage == Stage::Done }

    /// Account for the next relayed packet.
    pub fn observe(&mut self, packet: &Packet) -> Progress {
        if self.shape == ResponseShape::Query
            && self.stage == Stage::First
            && packet.is_local_infile()
        {
            self.stage = Stage::Done;
            return Progress::LocalInfile;
        }
        self.stage = match (self.shape, self.stage) {
            (_, Stage::Done) | (ResponseShape::Quit | ResponseShape::NoReply | ResponseShape::SingleFrame, _) => {
                Stage::Done
            }
            (ResponseShape::FieldList | ResponseShape::RowFetch, _) => {
                if packet.is_eof() || packet.is_err() {
                    Stage::Done
                } else {
                    self.stage
                }
            }
            (ResponseShape::Query | ResponseShape::StmtExecute, Stage::First) => result_start(packet),
            (ResponseShape::Query | ResponseShape::StmtExecute, Stage::Blocks(due)) => {
                result_block(packet, due)
            }
            (ResponseShape::StmtPrepare, Stage::First) => prepare_start(packet),
            (ResponseShape::StmtPrepare, Stage::Blocks(due)) => {
                if packet.is_err() {
                    Stage::Done
                } else if packet.is_eof() {
                    countdown(due)
                } else {
                    self.stage
                }
            }
        };
        if self.is_complete() { Progress::Complete } else { Progress::Continue }
    }
}

/// First packet of a query or execute result.
///
/// OK and ERR only end the reply here; later `0x00` bytes may begin a row.
fn result_start(packet: &Packet) -> Stage {
    if packet.is_err() {
        Stage::Done
    } else if packet.is_ok() {
        if packet.more_results_exist() { Stage::First } else { Stage::Done }
    } else if packet.is_eof() {
        // Legacy commands such as COM_DEBUG answer with a bare EOF.
        Stage::Done
    } else {
        // Column count; the column block and the row block each end with EOF.
        Stage::Blocks(2)
    }
}

fn result_block(packet: &Packet, due: u8) -> Stage {
    if packet.is_err() {
        return Stage::Done;
    }
    if !packet.is_eof() {
        return Stage::Blocks(due);
    }
    // An execute that opened a cursor sends no row block.
    if due == 2 && !packet.cursor_exists() {
        return Stage::Blocks(1);
    }
    if packet.more_results_exist() { Stage::First } else { Stage::Done }
}

fn prepare_start(packet: &Packet) -> Stage {
    if !packet.is_ok() {
        return Stage::Done;
    }
    // marker, statement id: u32, columns: u16, params: u16
    let payload = &packet.payload;
    let (Some(columns), Some(params)) = (
        read_le_u16_at(payload, 5),
        read_le_u16_at(payload, 7),
    ) else {
        return Stage::Done;
    };
    let due = u8::from(columns > 0) + u8::from(params > 0);
    if due == 0 { Stage::Done } else { Stage::Blocks(due) }
}

fn countdown(due: u8) -> Stage {
    match due {
        0 | 1 => Stage::Done,
        n => Stage::Blocks(n - 1),
    }
}

/// Forward the backend's reply for a command of `shape` to the client.
///
/// Packets are written to the client as they arrive; nothing beyond the
/// current packet is buffered. A `LOAD DATA LOCAL INFILE` request is declined
/// on the client's behalf: the backend receives an empty file and the client
/// receives `ER_NOT_ALLOWED_COMMAND` instead of the request.
///
/// # Errors
///
/// Returns a [`RelayError`] if reading from the backend or writing to the
/// client fails.
pub async fn relay_response<B, C>(
    backend: &mut B,
    client: &mut C,
    shape: ResponseShape,
) -> Result<(), RelayError>
where
    B: PacketIo + ?Sized,
    C: PacketIo + ?Sized,
{
    let mut tracker = ResponseTracker::new(shape);
    let mut relayed = 0_usize;
    while !tracker.is_complete() {
        let packet = recv(backend, Peer::Backend, Phase::Response).await?;
        if tracker.observe(&packet) == Progress::LocalInfile {
            return decline_local_infile(backend, client, &packet).await;
        }
        send(client, &packet, Peer::Client, Phase::Response).await?;
        metrics::inc_frames(Direction::ToClient);
        relayed += 1;
    }
    trace!(?shape, relayed, "response relayed");
    Ok(())
}

/// Answer a local file `request` with an empty upload and report an error to
/// the client, leaving the backend at a command boundary.
async fn decline_local_infile<B, C>(
    backend: &mut B,
    client: &mut C,
    request: &Packet,
) -> Result<(), RelayError>
where
    B: PacketIo + ?Sized,
    C: PacketIo + ?Sized,
{
    let upload_end = Packet::new(request.sequence_id.wrapping_add(1), Bytes::new());
    send(backend, &upload_end, Peer::Backend, Phase::Response).await?;
    let outcome = recv(backend, Peer::Backend, Phase::Response).await?;
    debug!(backend_error = outcome.is_err(), "declined LOCAL INFILE request");

    let refusal = Packet::error(
        request.sequence_id,
        ER_NOT_ALLOWED_COMMAND,
        "42000",
        "LOAD DATA LOCAL INFILE is not supported through this proxy",
    );
    send(client, &refusal, Peer::Client, Phase::Response).await?;
    metrics::inc_frames(Direction::ToClient);
    Ok(())
}
