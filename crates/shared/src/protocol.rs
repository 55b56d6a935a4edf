use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Send a message as a single JSON line.
///
/// Warning: Using private protocol, so do not send data without using this function.
pub async fn send_message<W, T>(stream: &mut W, message: &T) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.flush().await?;

    Ok(())
}

/// Receive a single JSON line message.
///
/// Returns [`Option::None`] when the stream is closed. Lines that are not
/// valid JSON for `T` are reported as [`std::io::ErrorKind::InvalidData`].
pub async fn receive_message<R, T>(stream: &mut R) -> Result<Option<T>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let read = stream.read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }

    let message = serde_json::from_str(line.trim_end())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{PluginCommand, PluginResponse};
    use serde_json::json;

    #[tokio::test]
    async fn round_trip_over_a_buffer() {
        let command = PluginCommand::new(3, "collect_metrics").with_field("name", json!("energy"));

        let mut buffer = Vec::new();
        send_message(&mut buffer, &command).await.unwrap();
        assert!(buffer.ends_with(b"\n"));

        let mut reader = std::io::Cursor::new(buffer);
        let received: PluginCommand = receive_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(received.cid, 3);
        assert_eq!(received.action, "collect_metrics");
        assert_eq!(received.fields.get("name"), Some(&json!("energy")));
    }

    #[tokio::test]
    async fn closed_stream_yields_none() {
        let mut reader = std::io::Cursor::new(Vec::new());
        let received: Option<PluginResponse> = receive_message(&mut reader).await.unwrap();
        assert!(received.is_none());
    }
}
