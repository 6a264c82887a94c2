//! Messages exchanged between the pool and its decoder workers.
//!
//! On a process boundary every message is one JSON header line; a successful
//! decode result is followed by exactly `byte_len` raw pixel bytes.

use crate::error::PoolError;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;

pub type TaskId = u64;

/// Only 8-bit samples cross the boundary.
pub const DTYPE_U8: &str = "uint8";

/// Pool → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Decode {
        task_id: TaskId,
        #[serde(with = "wire_path")]
        path: PathBuf,
    },
    Shutdown,
}

/// Paths travel as a string when they are valid UTF-8 and as raw bytes
/// otherwise, so any file name the OS allows reaches the worker intact.
mod wire_path {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::path::{Path, PathBuf};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(text) = path.to_str() {
            return serializer.serialize_str(text);
        }
        match to_bytes(path) {
            Some(bytes) => serializer.collect_seq(bytes),
            None => Err(S::Error::custom(format!(
                "path {} has no byte representation",
                path.display()
            ))),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Ok(PathBuf::from(text)),
            Repr::Bytes(bytes) => from_bytes(bytes)
                .ok_or_else(|| D::Error::custom("path bytes are not valid on this platform")),
        }
    }

    #[cfg(unix)]
    fn to_bytes(path: &Path) -> Option<Vec<u8>> {
        use std::os::unix::ffi::OsStrExt;
        Some(path.as_os_str().as_bytes().to_vec())
    }

    #[cfg(not(unix))]
    fn to_bytes(_path: &Path) -> Option<Vec<u8>> {
        None
    }

    #[cfg(unix)]
    fn from_bytes(bytes: Vec<u8>) -> Option<PathBuf> {
        use std::os::unix::ffi::OsStringExt;
        Some(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
    }

    #[cfg(not(unix))]
    fn from_bytes(bytes: Vec<u8>) -> Option<PathBuf> {
        String::from_utf8(bytes).ok().map(PathBuf::from)
    }
}

/// A queued decode plus how often it has been handed back.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRequest {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub attempt: u32,
}

impl DecodeRequest {
    pub fn new(task_id: TaskId, path: PathBuf) -> Self {
        Self {
            task_id,
            path,
            attempt: 0,
        }
    }
}

/// Pixels produced by a worker. Row major, interleaved channels.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPixels {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl DecodedPixels {
    /// `[height, width, channels]`
    pub fn shape(&self) -> [usize; 3] {
        [self.height as usize, self.width as usize, self.channels]
    }
}

/// Completion of one task, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeResult {
    pub task_id: TaskId,
    pub outcome: Result<DecodedPixels, String>,
}

impl DecodeResult {
    pub fn failed(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            outcome: Err(error.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Worker → pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    /// Initialisation finished; sent once at startup.
    Ready,
    Done(DecodeResult),
    /// Memory was too tight to start the decode; the request should be
    /// queued again later.
    Deferred { task_id: TaskId, memory_percent: f64 },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ReplyHeader {
    Ready,
    Result {
        task_id: TaskId,
        success: bool,
        #[serde(default)]
        width: u32,
        #[serde(default)]
        height: u32,
        #[serde(default)]
        shape: Vec<usize>,
        #[serde(default)]
        dtype: String,
        #[serde(default)]
        byte_len: usize,
        #[serde(default)]
        error: Option<String>,
    },
    Deferred {
        task_id: TaskId,
        memory_percent: f64,
    },
}

/// The request is encoded in full before anything is written, so an
/// encoding failure leaves the stream untouched.
pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<(), PoolError> {
    let mut line = serde_json::to_vec(request).map_err(|e| PoolError::Encode(e.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// `None` when the pool closed the pipe.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Option<Request>, PoolError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

pub fn write_reply<W: Write>(writer: &mut W, reply: &WorkerReply) -> Result<(), PoolError> {
    let (header, payload) = match reply {
        WorkerReply::Ready => (ReplyHeader::Ready, None),
        WorkerReply::Deferred {
            task_id,
            memory_percent,
        } => (
            ReplyHeader::Deferred {
                task_id: *task_id,
                memory_percent: *memory_percent,
            },
            None,
        ),
        WorkerReply::Done(result) => match &result.outcome {
            Ok(pixels) => (
                ReplyHeader::Result {
                    task_id: result.task_id,
                    success: true,
                    width: pixels.width,
                    height: pixels.height,
                    shape: pixels.shape().to_vec(),
                    dtype: DTYPE_U8.to_string(),
                    byte_len: pixels.data.len(),
                    error: None,
                },
                Some(pixels.data.as_slice()),
            ),
            Err(error) => (
                ReplyHeader::Result {
                    task_id: result.task_id,
                    success: false,
                    width: 0,
                    height: 0,
                    shape: Vec::new(),
                    dtype: String::new(),
                    byte_len: 0,
                    error: Some(error.clone()),
                },
                None,
            ),
        },
    };

    serde_json::to_writer(&mut *writer, &header)?;
    writer.write_all(b"\n")?;
    if let Some(payload) = payload {
        writer.write_all(payload)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_reply<R: BufRead>(reader: &mut R) -> Result<WorkerReply, PoolError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(PoolError::Disconnected);
    }

    let reply = match serde_json::from_str(line.trim_end())? {
        ReplyHeader::Ready => WorkerReply::Ready,
        ReplyHeader::Deferred {
            task_id,
            memory_percent,
        } => WorkerReply::Deferred {
            task_id,
            memory_percent,
        },
        ReplyHeader::Result {
            task_id,
            success: false,
            error,
            ..
        } => WorkerReply::Done(DecodeResult::failed(
            task_id,
            error.unwrap_or_else(|| "unspecified decode error".to_string()),
        )),
        ReplyHeader::Result {
            task_id,
            width,
            height,
            shape,
            dtype,
            byte_len,
            ..
        } => {
            let mut data = vec![0u8; byte_len];
            reader.read_exact(&mut data)?;
            WorkerReply::Done(DecodeResult {
                task_id,
                outcome: validate_pixels(width, height, &shape, &dtype, data),
            })
        }
    };
    Ok(reply)
}

fn validate_pixels(
    width: u32,
    height: u32,
    shape: &[usize],
    dtype: &str,
    data: Vec<u8>,
) -> Result<DecodedPixels, String> {
    if dtype != DTYPE_U8 {
        return Err(format!("unsupported dtype '{dtype}'"));
    }
    let &[h, w, channels] = shape else {
        return Err(format!("unexpected shape {shape:?}"));
    };
    if h != height as usize || w != width as usize || h * w * channels != data.len() {
        return Err(format!(
            "shape {shape:?} does not match {width}x{height} with {} bytes",
            data.len()
        ));
    }
    Ok(DecodedPixels {
        width,
        height,
        channels,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    fn pipe_reply(reply: &WorkerReply) -> WorkerReply {
        let mut buf = Vec::new();
        write_reply(&mut buf, reply).unwrap();
        read_reply(&mut BufReader::new(Cursor::new(buf))).unwrap()
    }

    #[test]
    fn test_success_carries_pixels_after_header() {
        let reply = WorkerReply::Done(DecodeResult {
            task_id: 7,
            outcome: Ok(DecodedPixels {
                width: 2,
                height: 1,
                channels: 4,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            }),
        });

        let mut buf = Vec::new();
        write_reply(&mut buf, &reply).unwrap();
        let header_end = buf.iter().position(|&b| b == b'\n').unwrap();
        let header: serde_json::Value = serde_json::from_slice(&buf[..header_end]).unwrap();
        assert_eq!(header["kind"], "result");
        assert_eq!(header["success"], true);
        assert_eq!(header["shape"], serde_json::json!([1, 2, 4]));
        assert_eq!(header["dtype"], "uint8");
        assert_eq!(&buf[header_end + 1..], &[1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(pipe_reply(&reply), reply);
    }

    #[test]
    fn test_consecutive_replies_on_one_stream() {
        let mut buf = Vec::new();
        write_reply(&mut buf, &WorkerReply::Ready).unwrap();
        write_reply(
            &mut buf,
            &WorkerReply::Done(DecodeResult {
                task_id: 1,
                outcome: Ok(DecodedPixels {
                    width: 1,
                    height: 1,
                    channels: 4,
                    data: vec![b'\n'; 4],
                }),
            }),
        )
        .unwrap();
        write_reply(&mut buf, &WorkerReply::Done(DecodeResult::failed(2, "corrupt"))).unwrap();
        write_reply(
            &mut buf,
            &WorkerReply::Deferred {
                task_id: 3,
                memory_percent: 97.5,
            },
        )
        .unwrap();

        let mut reader = BufReader::new(Cursor::new(buf));
        assert_eq!(read_reply(&mut reader).unwrap(), WorkerReply::Ready);
        match read_reply(&mut reader).unwrap() {
            WorkerReply::Done(result) => assert_eq!(result.outcome.unwrap().data, vec![b'\n'; 4]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            read_reply(&mut reader).unwrap(),
            WorkerReply::Done(DecodeResult::failed(2, "corrupt"))
        );
        assert_eq!(
            read_reply(&mut reader).unwrap(),
            WorkerReply::Deferred {
                task_id: 3,
                memory_percent: 97.5
            }
        );
        assert!(matches!(read_reply(&mut reader), Err(PoolError::Disconnected)));
    }

    #[test]
    fn test_inconsistent_shape_becomes_failure() {
        let header = r#"{"kind":"result","task_id":4,"success":true,"width":2,"height":2,"shape":[2,2,4],"dtype":"uint8","byte_len":3}"#;
        let mut buf = format!("{header}\n").into_bytes();
        buf.extend_from_slice(&[0, 0, 0]);

        match read_reply(&mut BufReader::new(Cursor::new(buf))).unwrap() {
            WorkerReply::Done(result) => {
                assert_eq!(result.task_id, 4);
                assert!(!result.success());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_requests_and_sentinel() {
        let mut buf = Vec::new();
        let decode = Request::Decode {
            task_id: 9,
            path: PathBuf::from("/raw/DSC_0001.NEF"),
        };
        write_request(&mut buf, &decode).unwrap();
        write_request(&mut buf, &Request::Shutdown).unwrap();

        let mut reader = BufReader::new(Cursor::new(buf));
        assert_eq!(read_request(&mut reader).unwrap(), Some(decode));
        assert_eq!(read_request(&mut reader).unwrap(), Some(Request::Shutdown));
        assert_eq!(read_request(&mut reader).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_path_survives_the_wire() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = PathBuf::from(OsStr::from_bytes(b"/photos/caf\xe9.nef"));
        let decode = Request::Decode {
            task_id: 5,
            path: path.clone(),
        };
        let mut buf = Vec::new();
        write_request(&mut buf, &decode).unwrap();
        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 1);

        let mut reader = BufReader::new(Cursor::new(buf));
        match read_request(&mut reader).unwrap() {
            Some(Request::Decode { task_id, path: read }) => {
                assert_eq!(task_id, 5);
                assert_eq!(read.as_os_str().as_bytes(), path.as_os_str().as_bytes());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_garbage_header_is_protocol_error() {
        let mut reader = BufReader::new(Cursor::new(b"hello\n".to_vec()));
        assert!(matches!(read_reply(&mut reader), Err(PoolError::Protocol(_))));
    }
}
