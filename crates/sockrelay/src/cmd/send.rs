use std::time::{Duration, Instant};

use sockrelay::frame::{decode_result, encode_packet, Frame, FrameKind, JobResult, Outcome, WorkPacket};
use sockrelay::transport::{dial, Connection};

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{frame_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_result, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let dial_timeout = parse_duration(&args.dial_timeout)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let kind = if args.binary {
        FrameKind::Binary
    } else {
        FrameKind::Text
    };

    let conn = dial(&args.url, dial_timeout).map_err(|err| transport_error("connect failed", err))?;
    let packet = WorkPacket::new(args.path);
    let message = encode_packet(&packet, kind)
        .and_then(Frame::into_message)
        .map_err(|err| frame_error("encode failed", err))?;
    conn.send(message)
        .map_err(|err| transport_error("send failed", err))?;

    let code = if args.wait {
        let result = wait_for_result(&conn, wait_timeout)?;
        print_result(&result, format);
        match result.outcome() {
            Outcome::Success => SUCCESS,
            Outcome::Failure => FAILURE,
        }
    } else {
        SUCCESS
    };

    conn.close();
    Ok(code)
}

fn wait_for_result(conn: &Connection, timeout: Duration) -> CliResult<JobResult> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CliError::new(
                TIMEOUT,
                format!("no result within {}ms", timeout.as_millis()),
            ));
        }
        conn.set_read_timeout(Some(remaining))
            .map_err(|err| transport_error("receive failed", err))?;
        let Some(message) = conn
            .read_message()
            .map_err(|err| transport_error("receive failed", err))?
        else {
            continue;
        };
        let frame = Frame::from_message(message).map_err(|err| frame_error("receive failed", err))?;
        return decode_result(&frame).map_err(|err| frame_error("decode failed", err));
    }
}
