use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};

/// Lines longer than this are split so a runaway writer cannot grow the buffer unbounded
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Newline-delimited decoder that tolerates invalid UTF-8 by replacing it,
/// since the core writes whatever its dependencies print.
#[derive(Debug, Default, Clone, Copy)]
pub struct LossyLineCodec;

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

impl Decoder for LossyLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = src.split_to(pos + 1);
                Ok(Some(lossy(&line[..pos])))
            }
            None if src.len() > MAX_LINE_BYTES => {
                let chunk = src.split_to(MAX_LINE_BYTES);
                Ok(Some(lossy(&chunk)))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(lossy(&rest)))
    }
}

/// Read `io` to the end, handing each line to `on_line`
pub async fn pump_lines<R, F>(io: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut frames = FramedRead::with_capacity(io, LossyLineCodec, 1024);
    while let Some(frame) = frames.next().await {
        on_line(frame?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_splits_lines_and_keeps_trailing_partial() {
        let input: &[u8] = b"first\r\nsecond\nthird";
        let mut lines = Vec::new();
        pump_lines(input, |line| lines.push(line)).await.unwrap();
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_pump_replaces_invalid_utf8() {
        let input: &[u8] = b"ok \xff\xfe bytes\n";
        let mut lines = Vec::new();
        pump_lines(input, |line| lines.push(line)).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
        assert!(lines[0].ends_with(" bytes"));
        assert!(lines[0].contains('\u{FFFD}'));
    }

    #[test]
    fn test_overlong_line_is_chunked() {
        let mut codec = LossyLineCodec;
        let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_BYTES + 10].as_slice());
        let chunk = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(chunk.len(), MAX_LINE_BYTES);
        assert_eq!(buf.len(), 10);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
