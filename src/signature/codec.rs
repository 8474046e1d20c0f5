//! Binary container format for signatures.
//!
//! Little-endian throughout: a 48-byte checksummed header, a magic/length
//! pair, then one tagged block per non-empty band holding a delta-encoded
//! peak stream padded to a 4-byte boundary. The layout is bit-exact and
//! forms a compatibility boundary with the remote identification service.

use thiserror::Error;

use super::{rate_code, rate_from_code, FrequencyPeak, Signature, NUM_BANDS};

const MAGIC1: u32 = 0xCAFE2580;
const MAGIC2: u32 = 0x94119C00;
const MAGIC3: u32 = 0x007C0000;
const MAGIC4: u32 = 0x40000000;
const BAND_TAG_BASE: u32 = 0x60030040;
const HEADER_LEN: usize = 48;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic")]
    BadMagic,
    #[error("bad checksum")]
    BadChecksum,
    #[error("bad length")]
    BadLength,
    #[error("bad sample rate code")]
    BadRate,
    #[error("bad band tag")]
    BadBand,
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Little-endian cursor over the encoded buffer. Running out of bytes is
/// a length error rather than a panic.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::BadLength);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

impl Signature {
    /// Serialize to the self-describing wire blob. Fails only for sample
    /// rates outside the closed supported set.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let code = rate_code(self.sample_rate).ok_or(CodecError::BadRate)?;

        let mut buf = Vec::new();
        put_u32(&mut buf, MAGIC1);
        put_u32(&mut buf, 0); // checksum, patched below
        put_u32(&mut buf, 0); // length, patched below
        put_u32(&mut buf, MAGIC2);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, code << 27);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, self.num_samples.wrapping_add((self.sample_rate as f64 * 0.24) as u32));
        put_u32(&mut buf, MAGIC3);
        put_u32(&mut buf, MAGIC4);
        put_u32(&mut buf, 0); // length2, patched below

        for (band, peaks) in self.peaks_by_band.iter().enumerate() {
            if peaks.is_empty() {
                continue;
            }
            let mut stream = Vec::new();
            let mut last_pass = 0u32;
            for peak in peaks {
                if peak.pass - last_pass >= 255 {
                    stream.push(0xFF);
                    stream.extend_from_slice(&peak.pass.to_le_bytes());
                    last_pass = peak.pass;
                }
                stream.push((peak.pass - last_pass) as u8);
                stream.extend_from_slice(&peak.magnitude.to_le_bytes());
                stream.extend_from_slice(&peak.bin.to_le_bytes());
                last_pass = peak.pass;
            }
            put_u32(&mut buf, BAND_TAG_BASE + band as u32);
            put_u32(&mut buf, stream.len() as u32);
            while stream.len() % 4 != 0 {
                stream.push(0x00);
            }
            buf.extend_from_slice(&stream);
        }

        let payload_len = (buf.len() - HEADER_LEN) as u32;
        buf[8..12].copy_from_slice(&payload_len.to_le_bytes());
        buf[52..56].copy_from_slice(&payload_len.to_le_bytes());
        let crc = crc32fast::hash(&buf[8..]);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse and validate an encoded signature. Every magic constant, both
    /// length fields and the CRC are checked before the payload is
    /// interpreted.
    pub fn decode(buf: &[u8]) -> Result<Signature, CodecError> {
        let total = buf.len();
        let mut r = Reader { buf };

        if r.u32()? != MAGIC1 {
            return Err(CodecError::BadMagic);
        }
        let crc = r.u32()?;
        if crc != crc32fast::hash(r.buf) {
            return Err(CodecError::BadChecksum);
        }
        if r.u32()? as usize != total - HEADER_LEN {
            return Err(CodecError::BadLength);
        }
        if r.u32()? != MAGIC2 {
            return Err(CodecError::BadMagic);
        }
        let (_, _, _) = (r.u32()?, r.u32()?, r.u32()?);
        let sample_rate = rate_from_code(r.u32()? >> 27).ok_or(CodecError::BadRate)?;
        let (_, _) = (r.u32()?, r.u32()?);
        let num_samples = r.u32()?.wrapping_sub((sample_rate as f64 * 0.24) as u32);
        if r.u32()? != MAGIC3 {
            return Err(CodecError::BadMagic);
        }
        if r.u32()? != MAGIC4 {
            return Err(CodecError::BadMagic);
        }
        if r.u32()? as usize != total - HEADER_LEN {
            return Err(CodecError::BadLength);
        }

        let mut sig = Signature {
            sample_rate,
            num_samples,
            peaks_by_band: Default::default(),
        };
        while r.remaining() > 0 {
            let tag = r.u32()?;
            let band = tag.wrapping_sub(BAND_TAG_BASE) as usize;
            if band >= NUM_BANDS {
                return Err(CodecError::BadBand);
            }
            let size = r.u32()? as usize;
            let padded = size + (4 - size % 4) % 4;
            let block = r.take(padded)?;
            let mut peaks = Reader { buf: &block[..size] };

            let mut pass = 0u32;
            while peaks.remaining() > 0 {
                let offset = peaks.u8()?;
                if offset == 0xFF {
                    pass = peaks.u32()?;
                    continue;
                }
                pass += offset as u32;
                let magnitude = peaks.u16()?;
                let bin = peaks.u16()?;
                sig.peaks_by_band[band].push(FrequencyPeak { pass, magnitude, bin });
            }
        }
        Ok(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signature() -> Signature {
        let mut sig = Signature {
            sample_rate: 16_000,
            num_samples: 192_000,
            peaks_by_band: Default::default(),
        };
        sig.peaks_by_band[0] = vec![
            FrequencyPeak { pass: 0, magnitude: 100, bin: 700 },
            FrequencyPeak { pass: 4, magnitude: 213, bin: 2100 },
            FrequencyPeak { pass: 4, magnitude: 40, bin: 2101 },
        ];
        // Delta over 255 forces the 0xFF pass reset marker.
        sig.peaks_by_band[2] = vec![
            FrequencyPeak { pass: 12, magnitude: 999, bin: 20_000 },
            FrequencyPeak { pass: 400, magnitude: 1000, bin: 20_040 },
            FrequencyPeak { pass: 401, magnitude: 8_191, bin: 64_927 },
        ];
        sig
    }

    #[test]
    fn round_trip() {
        let sig = sample_signature();
        let encoded = sig.encode().unwrap();
        assert_eq!(Signature::decode(&encoded).unwrap(), sig);
    }

    #[test]
    fn header_field_layout() {
        let sig = Signature {
            sample_rate: 16_000,
            num_samples: 128,
            peaks_by_band: Default::default(),
        };
        let encoded = sig.encode().unwrap();
        let field = |offset: usize| {
            u32::from_le_bytes(encoded[offset..offset + 4].try_into().unwrap())
        };
        assert_eq!(field(0), 0xCAFE2580);
        assert_eq!(field(4), crc32fast::hash(&encoded[8..]));
        assert_eq!(field(8), 8, "empty payload leaves only magic4+length2");
        assert_eq!(field(12), 0x94119C00);
        assert_eq!((field(16), field(20), field(24)), (0, 0, 0));
        assert_eq!(field(28), 3 << 27, "16 kHz carries rate code 3");
        assert_eq!((field(32), field(36)), (0, 0));
        assert_eq!(field(40), 128 + 3840, "sample count is biased by 0.24 s");
        assert_eq!(field(44), 0x007C0000);
        assert_eq!(field(48), 0x40000000);
        assert_eq!(field(52), field(8));
    }

    #[test]
    fn band_blocks_are_tagged_and_padded() {
        let mut sig = Signature {
            sample_rate: 16_000,
            num_samples: 0,
            peaks_by_band: Default::default(),
        };
        sig.peaks_by_band[1] = vec![FrequencyPeak { pass: 3, magnitude: 9, bin: 4000 }];
        let encoded = sig.encode().unwrap();
        let field = |offset: usize| {
            u32::from_le_bytes(encoded[offset..offset + 4].try_into().unwrap())
        };
        assert_eq!(field(56), BAND_TAG_BASE + 1);
        assert_eq!(field(60), 5, "one peak is a 5-byte stream before padding");
        assert_eq!(encoded.len(), 56 + 8 + 8, "stream is padded to 8 bytes");
        assert_eq!(encoded[64], 3, "pass delta");
        assert_eq!(&encoded[65..67], &9u16.to_le_bytes());
        assert_eq!(&encoded[67..69], &4000u16.to_le_bytes());
        assert_eq!(&encoded[69..72], &[0, 0, 0], "padding bytes are zero");
    }

    #[test]
    fn round_trip_empty() {
        let sig = Signature {
            sample_rate: 44_100,
            num_samples: 0,
            peaks_by_band: Default::default(),
        };
        let encoded = sig.encode().unwrap();
        assert_eq!(encoded.len(), 56);
        assert_eq!(Signature::decode(&encoded).unwrap(), sig);
    }

    #[test]
    fn round_trip_all_rates() {
        for rate in [8_000, 11_025, 16_000, 32_000, 44_100] {
            let sig = Signature {
                sample_rate: rate,
                num_samples: rate * 12,
                peaks_by_band: Default::default(),
            };
            let decoded = Signature::decode(&sig.encode().unwrap()).unwrap();
            assert_eq!(decoded.sample_rate, rate);
            assert_eq!(decoded.num_samples, rate * 12);
        }
    }

    #[test]
    fn encode_rejects_unknown_rate() {
        let sig = Signature {
            sample_rate: 22_050,
            num_samples: 0,
            peaks_by_band: Default::default(),
        };
        assert_eq!(sig.encode(), Err(CodecError::BadRate));
    }

    #[test]
    fn any_bit_flip_breaks_checksum() {
        let encoded = sample_signature().encode().unwrap();
        for byte in 8..encoded.len() {
            for bit in 0..8 {
                let mut corrupt = encoded.clone();
                corrupt[byte] ^= 1 << bit;
                assert_eq!(
                    Signature::decode(&corrupt),
                    Err(CodecError::BadChecksum),
                    "flip at byte {byte} bit {bit} must fail the checksum"
                );
            }
        }
    }

    #[test]
    fn bad_magics() {
        let encoded = sample_signature().encode().unwrap();

        let mut corrupt = encoded.clone();
        corrupt[0] ^= 0x01;
        assert_eq!(Signature::decode(&corrupt), Err(CodecError::BadMagic));

        // Patching payload bytes requires re-fixing the checksum to reach
        // the later validation stages.
        let patch = |mut buf: Vec<u8>, offset: usize, value: u32| {
            buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            let crc = crc32fast::hash(&buf[8..]);
            buf[4..8].copy_from_slice(&crc.to_le_bytes());
            buf
        };
        assert_eq!(
            Signature::decode(&patch(encoded.clone(), 12, 0xDEADBEEF)),
            Err(CodecError::BadMagic)
        );
        assert_eq!(
            Signature::decode(&patch(encoded.clone(), 44, 0)),
            Err(CodecError::BadMagic)
        );
        assert_eq!(
            Signature::decode(&patch(encoded.clone(), 48, 0)),
            Err(CodecError::BadMagic)
        );
        assert_eq!(
            Signature::decode(&patch(encoded.clone(), 8, 0)),
            Err(CodecError::BadLength)
        );
        assert_eq!(
            Signature::decode(&patch(encoded.clone(), 52, 1)),
            Err(CodecError::BadLength)
        );
        assert_eq!(
            Signature::decode(&patch(encoded.clone(), 28, 7 << 27)),
            Err(CodecError::BadRate)
        );
        assert_eq!(
            Signature::decode(&patch(encoded.clone(), 56, BAND_TAG_BASE + 5)),
            Err(CodecError::BadBand)
        );
    }

    #[test]
    fn truncated_input() {
        let encoded = sample_signature().encode().unwrap();
        assert_eq!(Signature::decode(&[]), Err(CodecError::BadLength));
        assert_eq!(
            Signature::decode(&encoded[..20]),
            Err(CodecError::BadChecksum),
            "truncation inside the header changes the checksummed span"
        );
    }

    #[test]
    fn pass_reset_marker_round_trips() {
        let mut sig = Signature {
            sample_rate: 16_000,
            num_samples: 1,
            peaks_by_band: Default::default(),
        };
        sig.peaks_by_band[4] = vec![
            FrequencyPeak { pass: 300, magnitude: 1, bin: 640 },
            FrequencyPeak { pass: 900, magnitude: 2, bin: 641 },
        ];
        let encoded = sig.encode().unwrap();
        // 0xFF marker, u32 pass, then the regular zero-delta entry.
        assert_eq!(encoded[56 + 8], 0xFF);
        assert_eq!(Signature::decode(&encoded).unwrap(), sig);
    }
}
