/*
 * Copyright (c) 2020-2022, Stalwart Labs Ltd.
 *
 * This file is part of the Stalwart Mesh Server.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 8 * 1024;
const MAX_BUFFERED: usize = 4 * 1024 * 1024;

/// Incremental reader for self-delimited MsgPack values. Buffers socket
/// data until a complete value is available; a truncated value waits for
/// more bytes, anything else malformed ends the session.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Reads the next MsgPack value. `Ok(None)` is a clean end of
    /// stream (EOF on a value boundary).
    pub async fn read_value<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = Cursor::new(&self.buf[..]);
                match rmp_serde::decode::from_read(&mut cursor) {
                    Ok(value) => {
                        let consumed = cursor.position() as usize;
                        self.buf.advance(consumed);
                        return Ok(Some(value));
                    }
                    Err(err) if is_truncated(&err) => {
                        if self.buf.len() > MAX_BUFFERED {
                            return Err(Error::Protocol(
                                "RPC frame too large".to_string(),
                            ));
                        }
                    }
                    Err(err) => {
                        return Err(Error::Protocol(format!(
                            "Malformed RPC frame: {}",
                            err
                        )));
                    }
                }
            }

            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return if self.buf.is_empty() {
                    // EOF between frames is a normal close on every
                    // platform.
                    Ok(None)
                } else {
                    Err(Error::Protocol(
                        "Connection closed mid-frame".to_string(),
                    ))
                };
            }
        }
    }
}

fn is_truncated(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error as DecodeError;
    match err {
        DecodeError::InvalidMarkerRead(io) | DecodeError::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Encodes `[header, body?]` as consecutive MsgPack values and writes
/// them in one call; callers serialize writes with the session lock.
pub async fn write_frame<W, H, B>(
    writer: &mut W,
    header: &H,
    body: Option<&B>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    H: Serialize,
    B: Serialize,
{
    let mut bytes = rmp_serde::to_vec(header)?;
    if let Some(body) = body {
        bytes.extend_from_slice(&rmp_serde::to_vec(body)?);
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Header {
        command: String,
        seq: u64,
    }

    #[tokio::test]
    async fn reads_consecutive_values_and_partial_frames() {
        let one = rmp_serde::to_vec(&Header {
            command: "handshake".to_string(),
            seq: 1,
        })
        .unwrap();
        let two = rmp_serde::to_vec(&Header {
            command: "members".to_string(),
            seq: 2,
        })
        .unwrap();
        let mut bytes = one;
        bytes.extend_from_slice(&two);

        // Feed the stream one byte at a time to exercise buffering.
        let (client, server) = tokio::io::duplex(16);
        let mut reader = FrameReader::new(server);
        let writer = tokio::spawn(async move {
            let mut client = client;
            for byte in bytes {
                client.write_all(&[byte]).await.unwrap();
            }
        });

        let first: Header = reader.read_value().await.unwrap().unwrap();
        assert_eq!(first.command, "handshake");
        let second: Header = reader.read_value().await.unwrap().unwrap();
        assert_eq!(second.seq, 2);
        writer.await.unwrap();

        // Clean EOF on a boundary.
        let eof: Option<Header> = reader.read_value().await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn malformed_data_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(16);
        let mut reader = FrameReader::new(server);
        client.write_all(&[0xc1, 0xc1, 0xc1]).await.unwrap();
        drop(client);

        let result: Result<Option<Header>> = reader.read_value().await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn frame_write_read_round_trip() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(server);

        write_frame(
            &mut client,
            &Header {
                command: "event".to_string(),
                seq: 7,
            },
            Some(&vec!["deploy".to_string()]),
        )
        .await
        .unwrap();

        let header: Header = reader.read_value().await.unwrap().unwrap();
        assert_eq!(header.seq, 7);
        let body: Vec<String> = reader.read_value().await.unwrap().unwrap();
        assert_eq!(body, vec!["deploy".to_string()]);
    }
}
