//! Single-member archive extraction over a forward-only byte stream.
//!
//! ZIP input is read from its first local file header; the member's data is
//! inflated as it is pulled and checked against its CRC-32 and size once the
//! compressed stream ends. Nothing past the first member is read, so further
//! members and the central directory are never touched. A gzip stream is
//! accepted as a single-member container.

use std::io::{self, BufRead, BufReader, Read};

use flate2::Crc;
use flate2::bufread::{DeflateDecoder, GzDecoder};

use crate::error::{ArchiveError, PipelineError};
use crate::provider::ByteStream;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_DIR_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const FLAG_ENCRYPTED: u16 = 1;
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;
const ZIP64_EXTRA_ID: u16 = 0x0001;
const ZIP64_MARKER: u32 = u32::MAX;

/// Buffer size for the compressed side of the stream (256KB)
const INPUT_BUF_SIZE: usize = 256 * 1024;

/// Container format detected from the leading magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    Gzip,
}

/// Decompressed bytes of the first archive member.
///
/// Dropping it drops the underlying source stream.
pub struct ArchiveMember {
    kind: ContainerKind,
    name: Option<String>,
    body: Body,
    check: Option<MemberCheck>,
    finished: bool,
}

type Input = BufReader<EofTracking>;

enum Body {
    Stored(io::Take<Input>),
    Deflate(DeflateDecoder<Input>),
    Gzip(GzDecoder<Input>),
}

/// Source wrapper remembering whether the raw input ran dry, so decoder
/// failures can be told apart as truncation.
struct EofTracking {
    inner: ByteStream,
    hit_eof: bool,
}

impl Read for EofTracking {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.hit_eof = true;
        }
        Ok(n)
    }
}

fn buffered(inner: ByteStream) -> Input {
    BufReader::with_capacity(
        INPUT_BUF_SIZE,
        EofTracking {
            inner,
            hit_eof: false,
        },
    )
}

/// Integrity bookkeeping for a ZIP member
struct MemberCheck {
    crc: Crc,
    /// From the local header; `None` when deferred to a data descriptor
    expected: Option<Expected>,
    zip64: bool,
}

#[derive(Debug, Clone, Copy)]
struct Expected {
    crc: u32,
    size: u64,
}

impl std::fmt::Debug for ArchiveMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveMember")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Open the single member of a ZIP or gzip container.
///
/// Reads just the header; decompression errors and truncation surface later,
/// from `read`, when the affected bytes are actually pulled.
pub fn open(mut input: ByteStream) -> Result<ArchiveMember, PipelineError> {
    let mut magic = [0u8; 4];
    read_exact_or(&mut input, &mut magic, || {
        ArchiveError::Format("input too short for an archive header".to_string())
    })?;

    if magic[..2] == GZIP_MAGIC {
        let rewound: ByteStream = Box::new(io::Cursor::new(magic).chain(input));
        let reader = buffered(rewound);
        log::debug!("gzip container");
        return Ok(ArchiveMember {
            kind: ContainerKind::Gzip,
            name: None,
            body: Body::Gzip(GzDecoder::new(reader)),
            check: None,
            finished: false,
        });
    }

    let mut reader = buffered(input);
    let mut sig = u32::from_le_bytes(magic);
    // Spanned archives lead with a lone descriptor signature
    if sig == DATA_DESCRIPTOR_SIG {
        sig = read_u32(&mut reader, "archive header")?;
    }
    match sig {
        LOCAL_HEADER_SIG => open_zip_member(reader),
        CENTRAL_DIR_SIG | END_OF_CENTRAL_DIR_SIG => Err(ArchiveError::Empty.into()),
        other => Err(ArchiveError::Format(format!(
            "unrecognised archive signature {other:#010x}"
        ))
        .into()),
    }
}

fn open_zip_member(mut reader: Input) -> Result<ArchiveMember, PipelineError> {
    let what = "local file header";
    let mut header = [0u8; 26];
    read_exact_or(&mut reader, &mut header, || {
        ArchiveError::Truncated(format!("input ended inside the {what}"))
    })?;
    let u16_at = |i: usize| u16::from_le_bytes([header[i], header[i + 1]]);
    let u32_at =
        |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);

    let flags = u16_at(2);
    let method = u16_at(4);
    let crc = u32_at(10);
    let compressed = u32_at(14);
    let uncompressed = u32_at(18);
    let name_len = u16_at(22) as usize;
    let extra_len = u16_at(24) as usize;

    let mut name = vec![0u8; name_len];
    read_exact_or(&mut reader, &mut name, || {
        ArchiveError::Truncated(format!("input ended inside the {what}"))
    })?;
    let mut extra = vec![0u8; extra_len];
    read_exact_or(&mut reader, &mut extra, || {
        ArchiveError::Truncated(format!("input ended inside the {what}"))
    })?;
    let name = String::from_utf8_lossy(&name).into_owned();

    if flags & FLAG_ENCRYPTED != 0 {
        return Err(ArchiveError::Format(format!("member {name} is encrypted")).into());
    }

    let zip64 = compressed == ZIP64_MARKER || uncompressed == ZIP64_MARKER;
    let (compressed, uncompressed) = if zip64 {
        zip64_sizes(&extra, compressed, uncompressed)?
    } else {
        (u64::from(compressed), u64::from(uncompressed))
    };

    let deferred = flags & FLAG_DATA_DESCRIPTOR != 0;
    let expected = (!deferred).then_some(Expected {
        crc,
        size: uncompressed,
    });
    log::debug!("zip member {name}: method {method}, {compressed} -> {uncompressed} bytes");

    let body = match method {
        METHOD_STORED if deferred => {
            return Err(ArchiveError::Format(format!(
                "stored member {name} has no size in its header and cannot be streamed"
            ))
            .into());
        }
        METHOD_STORED => Body::Stored(reader.take(compressed)),
        METHOD_DEFLATE => Body::Deflate(DeflateDecoder::new(reader)),
        other => {
            return Err(ArchiveError::Format(format!(
                "member {name} uses unsupported compression method {other}"
            ))
            .into());
        }
    };

    Ok(ArchiveMember {
        kind: ContainerKind::Zip,
        name: Some(name),
        body,
        check: Some(MemberCheck {
            crc: Crc::new(),
            expected,
            zip64,
        }),
        finished: false,
    })
}

/// Pull 64-bit sizes from the ZIP64 extended information extra field.
///
/// Only the sizes whose 32-bit header slot holds the marker are present, in
/// the order uncompressed, compressed.
fn zip64_sizes(
    extra: &[u8],
    compressed: u32,
    uncompressed: u32,
) -> Result<(u64, u64), PipelineError> {
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        let Some(data) = rest.get(4..4 + len) else {
            break;
        };
        if id == ZIP64_EXTRA_ID {
            let mut fields = data
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]));
            let mut pick = |header: u32| {
                if header == ZIP64_MARKER {
                    fields.next()
                } else {
                    Some(u64::from(header))
                }
            };
            let u = pick(uncompressed);
            let c = pick(compressed);
            if let (Some(c), Some(u)) = (c, u) {
                return Ok((c, u));
            }
            break;
        }
        rest = &rest[4 + len..];
    }
    Err(ArchiveError::Format("ZIP64 sizes missing from extra field".to_string()).into())
}

impl ArchiveMember {
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// Member file name (ZIP only)
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn input_exhausted(&self) -> bool {
        let input = match &self.body {
            Body::Stored(reader) => reader.get_ref(),
            Body::Deflate(decoder) => decoder.get_ref(),
            Body::Gzip(decoder) => decoder.get_ref(),
        };
        input.get_ref().hit_eof
    }

    /// Called once the decompressor reports end of data.
    fn finish(&mut self) -> Result<(), ArchiveError> {
        let Some(check) = &mut self.check else {
            return Ok(());
        };
        let expected = match &mut self.body {
            Body::Stored(reader) => {
                if reader.limit() > 0 {
                    return Err(ArchiveError::Truncated(format!(
                        "stored member ended {} bytes early",
                        reader.limit()
                    )));
                }
                check.expected
            }
            Body::Deflate(decoder) => match check.expected {
                Some(e) => Some(e),
                None => Some(read_data_descriptor(decoder.get_mut(), check.zip64)?),
            },
            Body::Gzip(_) => None,
        };
        let Some(expected) = expected else {
            return Ok(());
        };

        let produced = u64::from(check.crc.amount());
        // Crc::amount is u32 and wraps for members over 4GiB
        if produced != expected.size & u64::from(u32::MAX) {
            return Err(ArchiveError::Truncated(format!(
                "member ended after {produced} of {} bytes",
                expected.size
            )));
        }
        if check.crc.sum() != expected.crc {
            return Err(ArchiveError::Format(format!(
                "CRC-32 mismatch: expected {:#010x}, got {:#010x}",
                expected.crc,
                check.crc.sum()
            )));
        }
        Ok(())
    }
}

fn read_data_descriptor(reader: &mut Input, zip64: bool) -> Result<Expected, ArchiveError> {
    let next_u32 = |reader: &mut Input| -> Result<u32, ArchiveError> {
        let mut buf = [0u8; 4];
        reader
            .read_exact(&mut buf)
            .map_err(|_| ArchiveError::Truncated("input ended inside the data descriptor".to_string()))?;
        Ok(u32::from_le_bytes(buf))
    };
    let mut crc = next_u32(reader)?;
    // The descriptor signature is optional
    if crc == DATA_DESCRIPTOR_SIG {
        crc = next_u32(reader)?;
    }
    let size = if zip64 {
        let _compressed = u64::from(next_u32(reader)?) | u64::from(next_u32(reader)?) << 32;
        u64::from(next_u32(reader)?) | u64::from(next_u32(reader)?) << 32
    } else {
        let _compressed = next_u32(reader)?;
        u64::from(next_u32(reader)?)
    };
    Ok(Expected { crc, size })
}

impl Read for ArchiveMember {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let result = match &mut self.body {
            Body::Stored(reader) => reader.read(buf),
            Body::Deflate(decoder) => decoder.read(buf),
            Body::Gzip(decoder) => decoder.read(buf),
        };
        let n = match result {
            Ok(n) => n,
            Err(e) if matches!(self.body, Body::Stored(_)) => return Err(e),
            Err(e) => return Err(classify_decoder_error(e, self.input_exhausted())),
        };
        if n > 0 {
            if let Some(check) = &mut self.check {
                check.crc.update(&buf[..n]);
            }
            return Ok(n);
        }
        self.finished = true;
        self.finish()?;
        Ok(0)
    }
}

/// Classify decoder failures; source I/O errors pass through untouched.
fn classify_decoder_error(e: io::Error, input_exhausted: bool) -> io::Error {
    if e.get_ref().is_some_and(|inner| inner.is::<ArchiveError>()) {
        return e;
    }
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
            if input_exhausted =>
        {
            ArchiveError::Truncated(format!("compressed stream ended early: {e}")).into()
        }
        io::ErrorKind::UnexpectedEof => {
            ArchiveError::Truncated(format!("compressed stream ended early: {e}")).into()
        }
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            ArchiveError::Format(format!("corrupt compressed data: {e}")).into()
        }
        _ => e,
    }
}

fn read_exact_or(
    reader: &mut impl Read,
    buf: &mut [u8],
    on_eof: impl FnOnce() -> ArchiveError,
) -> Result<(), PipelineError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => PipelineError::Archive(on_eof()),
        _ => PipelineError::from(e),
    })
}

fn read_u32(reader: &mut impl BufRead, what: &str) -> Result<u32, PipelineError> {
    let mut buf = [0u8; 4];
    read_exact_or(reader, &mut buf, || {
        ArchiveError::Truncated(format!("input ended inside the {what}"))
    })?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::{DeflateEncoder, GzEncoder};
    use std::io::Write;

    /// Minimal ZIP writer for fixtures: local headers only, plus an empty
    /// central directory terminator.
    pub(crate) fn zip_bytes(members: &[(&str, &[u8])], deflate: bool, descriptor: bool) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in members {
            let mut crc = Crc::new();
            crc.update(data);
            let body = if deflate {
                let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
                enc.write_all(data).unwrap();
                enc.finish().unwrap()
            } else {
                data.to_vec()
            };
            let flags: u16 = if descriptor { FLAG_DATA_DESCRIPTOR } else { 0 };
            let method: u16 = if deflate { METHOD_DEFLATE } else { METHOD_STORED };
            let (hdr_crc, hdr_c, hdr_u) = if descriptor {
                (0, 0, 0)
            } else {
                (crc.sum(), body.len() as u32, data.len() as u32)
            };
            out.extend_from_slice(&LOCAL_HEADER_SIG.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&method.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&hdr_crc.to_le_bytes());
            out.extend_from_slice(&hdr_c.to_le_bytes());
            out.extend_from_slice(&hdr_u.to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&body);
            if descriptor {
                out.extend_from_slice(&DATA_DESCRIPTOR_SIG.to_le_bytes());
                out.extend_from_slice(&crc.sum().to_le_bytes());
                out.extend_from_slice(&(body.len() as u32).to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            }
        }
        out.extend_from_slice(&empty_zip());
        out
    }

    pub(crate) fn empty_zip() -> Vec<u8> {
        let mut out = END_OF_CENTRAL_DIR_SIG.to_le_bytes().to_vec();
        out.extend_from_slice(&[0u8; 18]);
        out
    }

    fn stream(bytes: Vec<u8>) -> ByteStream {
        Box::new(io::Cursor::new(bytes))
    }

    fn read_all(member: &mut ArchiveMember) -> Result<Vec<u8>, PipelineError> {
        let mut out = Vec::new();
        member.read_to_end(&mut out).map_err(PipelineError::from)?;
        Ok(out)
    }

    #[test]
    fn deflate_member() {
        let zip = zip_bytes(&[("a.json", b"{\"results\":[1,2]}")], true, false);
        let mut member = open(stream(zip)).unwrap();
        assert_eq!(member.kind(), ContainerKind::Zip);
        assert_eq!(member.name(), Some("a.json"));
        assert_eq!(read_all(&mut member).unwrap(), b"{\"results\":[1,2]}");
    }

    #[test]
    fn stored_member() {
        let zip = zip_bytes(&[("a.json", b"[true]")], false, false);
        let mut member = open(stream(zip)).unwrap();
        assert_eq!(read_all(&mut member).unwrap(), b"[true]");
    }

    #[test]
    fn deflate_with_data_descriptor() {
        let zip = zip_bytes(&[("a.json", b"{\"k\":\"v\"}")], true, true);
        let mut member = open(stream(zip)).unwrap();
        assert_eq!(read_all(&mut member).unwrap(), b"{\"k\":\"v\"}");
    }

    #[test]
    fn second_member_ignored() {
        let zip = zip_bytes(&[("first", b"one"), ("second", b"two")], true, false);
        let mut member = open(stream(zip)).unwrap();
        assert_eq!(member.name(), Some("first"));
        assert_eq!(read_all(&mut member).unwrap(), b"one");
    }

    #[test]
    fn empty_archive() {
        let err = open(stream(empty_zip())).unwrap_err();
        assert_eq!(err.kind(), "EmptyArchiveError");
    }

    #[test]
    fn unknown_header_is_format_error() {
        let err = open(stream(b"{\"results\": []}".to_vec())).unwrap_err();
        assert_eq!(err.kind(), "FormatError");
    }

    #[test]
    fn tiny_input_is_format_error() {
        let err = open(stream(b"PK".to_vec())).unwrap_err();
        assert_eq!(err.kind(), "FormatError");
    }

    #[test]
    fn truncated_header() {
        let zip = zip_bytes(&[("a.json", b"data")], true, false);
        let err = open(stream(zip[..12].to_vec())).unwrap_err();
        assert_eq!(err.kind(), "TruncatedInputError");
    }

    #[test]
    fn truncated_member_surfaces_on_read() {
        let payload = vec![b'x'; 10_000];
        let zip = zip_bytes(&[("big", &payload)], false, false);
        let cut = zip.len() - 22 - 4000;
        let mut member = open(stream(zip[..cut].to_vec())).unwrap();
        let err = read_all(&mut member).unwrap_err();
        assert_eq!(err.kind(), "TruncatedInputError");
    }

    #[test]
    fn truncated_deflate_member_surfaces_on_read() {
        let payload: Vec<u8> = (0..50_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let zip = zip_bytes(&[("big", &payload)], true, false);
        let cut = 30 + 3 + 200;
        let mut member = open(stream(zip[..cut].to_vec())).unwrap();
        let err = read_all(&mut member).unwrap_err();
        assert_eq!(err.kind(), "TruncatedInputError");
    }

    #[test]
    fn crc_mismatch_is_format_error() {
        let mut zip = zip_bytes(&[("a", b"hello")], false, false);
        // flip a byte of stored data: header is 30 bytes + 1 byte name
        zip[31] ^= 0xff;
        let mut member = open(stream(zip)).unwrap();
        let err = read_all(&mut member).unwrap_err();
        assert_eq!(err.kind(), "FormatError");
    }

    #[test]
    fn encrypted_member_rejected() {
        let mut zip = zip_bytes(&[("a", b"hello")], false, false);
        zip[6] |= FLAG_ENCRYPTED as u8;
        let err = open(stream(zip)).unwrap_err();
        assert_eq!(err.kind(), "FormatError");
    }

    #[test]
    fn gzip_container() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"{\"results\":[]}").unwrap();
        let gz = enc.finish().unwrap();
        let mut member = open(stream(gz)).unwrap();
        assert_eq!(member.kind(), ContainerKind::Gzip);
        assert_eq!(read_all(&mut member).unwrap(), b"{\"results\":[]}");
    }

    #[test]
    fn truncated_gzip_surfaces_on_read() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&vec![7u8; 100_000]).unwrap();
        let gz = enc.finish().unwrap();
        let mut member = open(stream(gz[..gz.len() - 6].to_vec())).unwrap();
        let err = read_all(&mut member).unwrap_err();
        assert_eq!(err.kind(), "TruncatedInputError");
    }
}
