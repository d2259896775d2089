//! Container log streaming
//!
//! Produces a lazy sequence of log lines. The sequence is single-use: an
//! error from the runtime becomes one final diagnostic line and the stream
//! ends. Dropping the stream (e.g. on client disconnect) releases the
//! underlying runtime log stream.

use bollard::container::{LogOutput, LogsOptions};
use bollard::Docker;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tracing::error;

/// Decode one runtime log chunk into a trimmed UTF-8 line.
pub fn format_log_line(output: LogOutput) -> String {
    String::from_utf8_lossy(&output.into_bytes())
        .trim()
        .to_string()
}

/// Stream timestamped log lines from a container.
///
/// Tails `tail` lines initially; with `follow` the stream stays open until
/// the caller stops consuming or the container terminates.
pub fn stream_logs(
    client: &Docker,
    container_id: &str,
    follow: bool,
    tail: u32,
) -> impl Stream<Item = String> {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        follow,
        tail: tail.to_string(),
        timestamps: true,
        ..Default::default()
    };

    let inner: BoxStream<'static, Result<LogOutput, bollard::errors::Error>> =
        client.logs(container_id, Some(options)).boxed();

    stream::unfold((inner, false), |(mut inner, done)| async move {
        if done {
            return None;
        }
        match inner.next().await {
            Some(Ok(output)) => Some((format_log_line(output), (inner, false))),
            Some(Err(e)) => {
                error!("Failed to stream logs: {}", e);
                Some((format!("Error streaming logs: {e}"), (inner, true)))
            }
            None => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_log_line_trims() {
        let output = LogOutput::StdOut {
            message: "2024-01-01T00:00:00Z hello world\n".into(),
        };
        assert_eq!(format_log_line(output), "2024-01-01T00:00:00Z hello world");
    }

    #[test]
    fn test_format_log_line_replaces_invalid_utf8() {
        let output = LogOutput::StdErr {
            message: bytes::Bytes::from(vec![0x68, 0x69, 0xff, 0x0a]),
        };
        assert_eq!(format_log_line(output), "hi\u{fffd}");
    }
}
