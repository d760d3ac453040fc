//! CIA container structures and the encrypted-content reader.
//!
//! A CIA is a chain of 64-byte-aligned blobs: certificate chain,
//! ticket, TMD, content, optional meta (SMDH). Contents flagged as
//! encrypted use AES-CBC under the title key, which is itself wrapped
//! in the ticket under a common key selected by the ticket's KeyY
//! index.

use std::io;
use std::rc::Rc;

use log::{debug, warn};

use super::keys::{AesCbcCipher, KeyManager, VerifyResult, scramble_ctr};
use rom_peek_core::byteorder::{read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le};
use rom_peek_core::{ParseError, ReadAt, text};

pub const CIA_HEADER_SIZE: u32 = 0x2020;

/// Maximum TMD content-chunk records. The format field is 16-bit but
/// no CIA in the wild carries more than 255 contents.
pub const MAX_CONTENT_COUNT: usize = 255;

/// `round_up_64(x) = (x + 63) & !63`
pub fn align64(val: u64) -> u64 {
    (val + 63) & !63
}

/// Signature-prefix size (including the 4-byte type) for ticket/TMD.
pub fn signature_block_size(sig_type: u32) -> Option<usize> {
    match sig_type {
        0x00010000 | 0x00010003 => Some(4 + 0x200 + 0x3C), // RSA-4096
        0x00010001 | 0x00010004 => Some(4 + 0x100 + 0x3C), // RSA-2048
        0x00010002 | 0x00010005 => Some(4 + 0x3C + 0x40),  // ECDSA
        _ => None,
    }
}

/// Parsed CIA outer header.
#[derive(Debug, Clone)]
pub struct CiaHeader {
    pub cert_chain_size: u32,
    pub ticket_size: u32,
    pub tmd_size: u32,
    pub meta_size: u32,
    pub content_size: u64,
}

impl CiaHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 0x20 {
            return None;
        }
        if read_u32_le(buf, 0x00) != CIA_HEADER_SIZE {
            return None;
        }
        if read_u16_le(buf, 0x04) != 0 || read_u16_le(buf, 0x06) != 0 {
            return None;
        }
        let header = Self {
            cert_chain_size: read_u32_le(buf, 0x08),
            ticket_size: read_u32_le(buf, 0x0C),
            tmd_size: read_u32_le(buf, 0x10),
            meta_size: read_u32_le(buf, 0x14),
            content_size: read_u64_le(buf, 0x18),
        };
        // Sanity ranges keep garbage files from matching.
        if header.cert_chain_size == 0
            || header.cert_chain_size >= 0x10000
            || header.ticket_size == 0
            || header.ticket_size >= 0x10000
            || header.tmd_size == 0
            || header.tmd_size >= 0x100000
            || header.content_size == 0
        {
            return None;
        }
        Some(header)
    }

    pub fn ticket_offset(&self) -> u64 {
        align64(CIA_HEADER_SIZE as u64) + align64(self.cert_chain_size as u64)
    }

    pub fn tmd_offset(&self) -> u64 {
        self.ticket_offset() + align64(self.ticket_size as u64)
    }

    pub fn content_offset(&self) -> u64 {
        self.tmd_offset() + align64(self.tmd_size as u64)
    }

    pub fn meta_offset(&self) -> u64 {
        self.content_offset() + align64(self.content_size)
    }
}

/// Parsed (signature-stripped) ticket fields.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub issuer: String,
    pub title_key_enc: [u8; 16],
    pub title_id: u64,
    pub key_y_index: u8,
}

impl Ticket {
    pub fn parse(stream: &dyn ReadAt, offset: u64) -> Option<Self> {
        let mut sig = [0u8; 4];
        if stream.read_at(offset, &mut sig).ok()? != 4 {
            return None;
        }
        let prefix = signature_block_size(read_u32_be(&sig, 0))?;
        let mut body = [0u8; 0x164];
        if stream.read_at(offset + prefix as u64, &mut body).ok()? != body.len() {
            return None;
        }
        let mut title_key_enc = [0u8; 16];
        title_key_enc.copy_from_slice(&body[0x7F..0x8F]);
        Some(Self {
            issuer: text::read_ascii(&body[0..0x40]),
            title_key_enc,
            title_id: read_u64_be(&body, 0x9C),
            key_y_index: body[0xB1],
        })
    }

    /// Retail tickets are issued by XS0000000c, debug by XS00000009.
    pub fn is_debug(&self) -> bool {
        self.issuer == "Root-CA00000004-XS00000009"
    }

    pub fn key_prefix(&self) -> &'static str {
        if self.is_debug() { "ctr-dev" } else { "ctr" }
    }
}

/// One TMD content-chunk record.
#[derive(Debug, Clone)]
pub struct ContentChunkRecord {
    pub id: u32,
    pub index: u16,
    pub type_flags: u16,
    pub size: u64,
    pub sha256: [u8; 32],
}

impl ContentChunkRecord {
    pub fn is_encrypted(&self) -> bool {
        self.type_flags & 0x0001 != 0
    }

    /// CDN-optional contents may be absent from the CIA.
    pub fn is_optional(&self) -> bool {
        self.type_flags & 0x4000 != 0
    }
}

/// Parsed TMD plus its content-chunk records.
#[derive(Debug, Clone)]
pub struct Tmd {
    pub title_id: u64,
    pub title_version: u16,
    pub boot_content: u16,
    pub chunks: Vec<ContentChunkRecord>,
}

impl Tmd {
    pub fn parse(stream: &dyn ReadAt, offset: u64) -> Option<Self> {
        let mut sig = [0u8; 4];
        if stream.read_at(offset, &mut sig).ok()? != 4 {
            return None;
        }
        let prefix = signature_block_size(read_u32_be(&sig, 0))?;
        let header_offset = offset + prefix as u64;
        let mut header = [0u8; 0xC4];
        if stream.read_at(header_offset, &mut header).ok()? != header.len() {
            return None;
        }
        let title_id = read_u64_be(&header, 0x4C);
        let title_version = read_u16_be(&header, 0x9C);
        let content_count = (read_u16_be(&header, 0x9E) as usize).min(MAX_CONTENT_COUNT);
        let boot_content = read_u16_be(&header, 0xA0);

        // 64 content-info records sit between the header and the
        // content-chunk records.
        let chunks_offset = header_offset + 0xC4 + 64 * 0x24;
        let mut raw = vec![0u8; content_count * 0x30];
        if stream.read_at(chunks_offset, &mut raw).ok()? != raw.len() {
            return None;
        }
        let chunks = raw
            .chunks_exact(0x30)
            .map(|c| {
                let mut sha256 = [0u8; 32];
                sha256.copy_from_slice(&c[0x10..0x30]);
                ContentChunkRecord {
                    id: read_u32_be(c, 0x00),
                    index: read_u16_be(c, 0x04),
                    type_flags: read_u16_be(c, 0x06),
                    size: read_u64_be(c, 0x08),
                    sha256,
                }
            })
            .collect();

        Some(Self {
            title_id,
            title_version,
            boot_content,
            chunks,
        })
    }
}

/// Decrypt the ticket's title key under the common key selected by
/// the ticket's KeyY index. The common key comes from the key store,
/// either directly (`KeyNormal`) or derived via the scrambler.
pub fn decrypt_title_key(
    ticket: &Ticket,
    key_manager: &KeyManager,
) -> Result<[u8; 16], VerifyResult> {
    let prefix = ticket.key_prefix();
    let index = ticket.key_y_index;

    let normal_name = format!("{prefix}-Slot0x3DKeyNormal-{index}");
    let key_normal = match key_manager.get_and_verify(&normal_name) {
        Ok((k, _)) => k,
        Err(rom_peek_core::ParseError::WrongKey(_)) => return Err(VerifyResult::WrongKey),
        Err(_) => {
            // Derive from KeyX/KeyY when the normal key isn't stored.
            let x_name = format!("{prefix}-Slot0x3DKeyX");
            let y_name = format!("{prefix}-Slot0x3DKeyY-{index}");
            let key_x = match key_manager.get_and_verify(&x_name) {
                Ok((k, _)) => k,
                Err(rom_peek_core::ParseError::WrongKey(_)) => {
                    return Err(VerifyResult::WrongKey);
                }
                Err(_) => return Err(VerifyResult::KeyNotFound),
            };
            let key_y = match key_manager.get_and_verify(&y_name) {
                Ok((k, _)) => k,
                Err(rom_peek_core::ParseError::WrongKey(_)) => {
                    return Err(VerifyResult::WrongKey);
                }
                Err(_) => return Err(VerifyResult::KeyNotFound),
            };
            scramble_ctr(&key_x, &key_y)
        }
    };

    // IV: big-endian title ID followed by zeros.
    let mut iv = [0u8; 16];
    iv[0..8].copy_from_slice(&ticket.title_id.to_be_bytes());
    let mut title_key = ticket.title_key_enc;
    AesCbcCipher::new(key_normal)
        .decrypt(&iv, &mut title_key)
        .map_err(|_| VerifyResult::WrongKey)?;
    Ok(title_key)
}

/// Outcome of checking a content blob against its TMD digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    Ok,
    Mismatch,
    /// TMD carries no digest for this chunk.
    NoDigest,
    /// Content is encrypted or unreadable; not checked.
    Skipped,
}

/// Verify a plaintext content blob against its TMD SHA-256.
pub fn verify_content_hash(
    reader: &dyn ReadAt,
    chunk: &ContentChunkRecord,
) -> Result<HashStatus, ParseError> {
    use sha2::{Digest, Sha256};

    if chunk.sha256.iter().all(|&b| b == 0) {
        return Ok(HashStatus::NoDigest);
    }
    if chunk.is_encrypted() {
        return Ok(HashStatus::Skipped);
    }

    let mut hasher = Sha256::new();
    let mut remaining = chunk.size;
    let mut offset = 0u64;
    let mut buf = vec![0u8; 0x10000];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read_at(offset, &mut buf[..want])?;
        if n == 0 {
            return Ok(HashStatus::Skipped);
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
        remaining -= n as u64;
    }
    if hasher.finalize().as_slice() == chunk.sha256 {
        Ok(HashStatus::Ok)
    } else {
        Ok(HashStatus::Mismatch)
    }
}

/// Streaming reader over one CIA content blob.
pub struct CiaReader {
    inner: Rc<dyn ReadAt>,
    content_offset: u64,
    content_length: u64,
    /// Title key and base IV when the content is encrypted and the
    /// key chain resolved.
    cipher: Option<([u8; 16], [u8; 16])>,
    verify_result: VerifyResult,
}

impl CiaReader {
    /// Construct over `inner[content_offset ..]`. When `ticket` is
    /// given and the chunk is flagged encrypted, reads decrypt
    /// AES-CBC; a missing common key degrades to raw reads with the
    /// gap recorded in `verify_result`.
    pub fn new(
        inner: Rc<dyn ReadAt>,
        content_offset: u64,
        content_length: u64,
        ticket: Option<&Ticket>,
        content_index: u16,
        key_manager: &KeyManager,
    ) -> Self {
        let mut cipher = None;
        let mut verify_result = VerifyResult::Ok;

        if let Some(ticket) = ticket {
            match decrypt_title_key(ticket, key_manager) {
                Ok(title_key) => {
                    // IV: big-endian content index, then zeros.
                    let mut iv = [0u8; 16];
                    iv[0..2].copy_from_slice(&content_index.to_be_bytes());
                    cipher = Some((title_key, iv));
                }
                Err(v) => {
                    warn!("CIA title key unavailable: {v:?}; reading content raw");
                    verify_result = v;
                }
            }
        }

        Self {
            inner,
            content_offset,
            content_length,
            cipher,
            verify_result,
        }
    }

    pub fn verify_result(&self) -> VerifyResult {
        self.verify_result
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }
}

impl ReadAt for CiaReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.content_length {
            return Ok(0);
        }
        let want = (self.content_length - offset).min(buf.len() as u64) as usize;
        let buf = &mut buf[..want];

        let Some((key, iv0)) = &self.cipher else {
            return self.inner.read_at(self.content_offset + offset, buf);
        };

        // Round down to the AES block; the IV for a mid-stream block
        // is the previous ciphertext block.
        let aligned = offset & !0xF;
        let skew = (offset - aligned) as usize;
        let mut iv = *iv0;
        if aligned > 0 {
            let mut prev = [0u8; 16];
            let n = self
                .inner
                .read_at(self.content_offset + aligned - 16, &mut prev)?;
            if n != 16 {
                return Ok(0);
            }
            iv = prev;
        }

        let padded = (skew + want + 15) & !0xF;
        let mut block_buf = vec![0u8; padded];
        let n = self
            .inner
            .read_at(self.content_offset + aligned, &mut block_buf)?;
        if n < skew + want {
            // Clamp to whole blocks actually read.
            let usable = n & !0xF;
            if usable <= skew {
                return Ok(0);
            }
            block_buf.truncate(usable);
        }
        debug!(
            "CIA content read: 0x{aligned:X}+0x{:X} (skew {skew})",
            block_buf.len()
        );
        AesCbcCipher::new(*key)
            .decrypt(&iv, &mut block_buf)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let got = (block_buf.len() - skew).min(want);
        buf[..got].copy_from_slice(&block_buf[skew..skew + got]);
        Ok(got)
    }

    fn size(&self) -> u64 {
        self.content_length
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

#[cfg(test)]
#[path = "tests/cia_tests.rs"]
mod tests;
