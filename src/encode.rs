//! K-mer encoding: alphabet mapping, reverse complement, canonicalization and the
//! two key backends.
//!
//! Conventions
//! - Text is normalized to upper case on ingestion; only `A`, `C`, `G`, `T` are valid.
//! - `canonicalize` returns the lexicographically smaller of a k-mer and its
//!   reverse complement.
//! - Packed keys are **MSB-first**: 2 bits per base (A=00, C=01, G=10, T=11), the
//!   leading word zero-padded so that word-wise comparison equals lexicographic
//!   comparison of the source text.

use std::cmp::Ordering;
use std::str::FromStr;

use crate::error::{KmerError, Result};

/// Largest supported k.
pub const MAX_K: usize = 255;

/// Bases per packed word.
const BASES_PER_WORD: usize = 32;

/// 256-entry LUT: ASCII → 2-bit (A=0, C=1, G=2, T=3), 0xFF for anything else.
pub static MAP_LUT: [u8; 256] = {
    const X: u8 = 0xFF;
    let mut t = [X; 256];
    t[b'A' as usize] = 0;
    t[b'a' as usize] = 0;
    t[b'C' as usize] = 1;
    t[b'c' as usize] = 1;
    t[b'G' as usize] = 2;
    t[b'g' as usize] = 2;
    t[b'T' as usize] = 3;
    t[b't' as usize] = 3;
    t
};

const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// 2-bit code of a base. `None` if outside the alphabet.
#[inline]
pub fn map_base(b: u8) -> Option<u8> {
    let v = MAP_LUT[b as usize];
    if v <= 3 { Some(v) } else { None }
}

/// Upper-case Watson-Crick complement of a base. `None` if outside the alphabet.
#[inline]
pub fn complement(b: u8) -> Option<u8> {
    map_base(b).map(|v| BASES[(v ^ 0b11) as usize])
}

/// Check that `k` is within `1..=MAX_K`.
pub fn validate_k(k: usize) -> Result<()> {
    if k == 0 || k > MAX_K {
        return Err(KmerError::InvalidLength { k, max: MAX_K });
    }
    Ok(())
}

/// Upper-case a nucleotide string, rejecting symbols outside the alphabet.
pub fn normalize(seq: &[u8]) -> Result<Vec<u8>> {
    seq.iter()
        .enumerate()
        .map(|(position, &b)| {
            map_base(b)
                .map(|v| BASES[v as usize])
                .ok_or(KmerError::InvalidAlphabet {
                    symbol: char::from(b),
                    position,
                })
        })
        .collect()
}

/// Reverse complement of a nucleotide string (upper case).
pub fn revcomp(seq: &[u8]) -> Result<Vec<u8>> {
    let mut rc = normalize(seq)?;
    rc.reverse();
    for b in rc.iter_mut() {
        *b = BASES[(MAP_LUT[*b as usize] ^ 0b11) as usize];
    }
    Ok(rc)
}

/// Canonical form: `seq` or its reverse complement, whichever sorts first.
///
/// Fails with [`KmerError::InvalidAlphabet`]; callers skip such windows.
pub fn canonicalize(seq: &[u8]) -> Result<Vec<u8>> {
    let fwd = normalize(seq)?;
    let n = fwd.len();
    // First position where fwd and rc differ decides the strand.
    let use_rc = (0..n)
        .map(|i| (fwd[i], BASES[(MAP_LUT[fwd[n - 1 - i] as usize] ^ 0b11) as usize]))
        .find(|(f, r)| f != r)
        .is_some_and(|(f, r)| r < f);
    if use_rc {
        let mut rc = fwd;
        rc.reverse();
        for b in rc.iter_mut() {
            *b = BASES[(MAP_LUT[*b as usize] ^ 0b11) as usize];
        }
        Ok(rc)
    } else {
        Ok(fwd)
    }
}

// ---------------- Keys ----------------

/// Storage and sort key of a canonical k-mer.
///
/// Both variants order word-by-word (bytes or `u64` words), ties broken by
/// length. Keys from different backends never share an index; across variants
/// `Bytes` sorts first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EncodedKey {
    /// One upper-case ASCII byte per base.
    Bytes(Box<[u8]>),
    /// Two bits per base, MSB-first, leading word zero-padded.
    Packed { len: u16, words: Box<[u64]> },
}

impl EncodedKey {
    /// Number of bases encoded.
    pub fn len(&self) -> usize {
        match self {
            EncodedKey::Bytes(b) => b.len(),
            EncodedKey::Packed { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 2-bit code of base `i` (0-based from the start of the k-mer).
    #[inline]
    pub fn base_code(&self, i: usize) -> u8 {
        match self {
            EncodedKey::Bytes(b) => MAP_LUT[b[i] as usize] & 0b11,
            EncodedKey::Packed { len, words } => {
                let pad = words.len() * BASES_PER_WORD - *len as usize;
                let slot = pad + i;
                let shift = 2 * (BASES_PER_WORD - 1 - slot % BASES_PER_WORD);
                ((words[slot / BASES_PER_WORD] >> shift) & 0b11) as u8
            }
        }
    }

    /// The first `n` bases as a 2-bit packed integer (`n` clamped to the key length).
    pub fn prefix_code(&self, n: usize) -> usize {
        (0..n.min(self.len())).fold(0usize, |acc, i| (acc << 2) | self.base_code(i) as usize)
    }
}

impl Ord for EncodedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (EncodedKey::Bytes(a), EncodedKey::Bytes(b)) => a.cmp(b),
            (
                EncodedKey::Packed { len: la, words: wa },
                EncodedKey::Packed { len: lb, words: wb },
            ) => wa
                .iter()
                .zip(wb.iter())
                .map(|(x, y)| x.cmp(y))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| la.cmp(lb)),
            (EncodedKey::Bytes(_), EncodedKey::Packed { .. }) => Ordering::Less,
            (EncodedKey::Packed { .. }, EncodedKey::Bytes(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for EncodedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------- Codecs ----------------

/// Encode/decode capability shared by both key backends.
pub trait KmerCodec {
    /// Encode an already-canonical k-mer.
    fn encode(&self, canonical: &[u8]) -> Result<EncodedKey>;

    /// Exact inverse of [`encode`](KmerCodec::encode) for a key of declared `len`.
    fn decode(&self, key: &EncodedKey, len: usize) -> Result<Vec<u8>>;

    /// Total order consistent with lexicographic order of the canonical text.
    fn compare(&self, a: &EncodedKey, b: &EncodedKey) -> Ordering {
        a.cmp(b)
    }

    /// Canonicalize and encode in one step.
    fn encode_canonical(&self, seq: &[u8]) -> Result<EncodedKey> {
        self.encode(&canonicalize(seq)?)
    }
}

/// One byte per base; keys stay human-readable.
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteCodec;

impl KmerCodec for ByteCodec {
    fn encode(&self, canonical: &[u8]) -> Result<EncodedKey> {
        Ok(EncodedKey::Bytes(normalize(canonical)?.into_boxed_slice()))
    }

    fn decode(&self, key: &EncodedKey, len: usize) -> Result<Vec<u8>> {
        match key {
            EncodedKey::Bytes(b) if b.len() == len => Ok(b.to_vec()),
            EncodedKey::Bytes(b) => Err(KmerError::InvalidKey(format!(
                "byte key holds {} bases, expected {len}",
                b.len()
            ))),
            EncodedKey::Packed { .. } => {
                Err(KmerError::InvalidKey("packed key given to byte codec".into()))
            }
        }
    }
}

/// Two bits per base in `u64` words.
#[derive(Clone, Copy, Debug, Default)]
pub struct PackedCodec;

/// Pack up to 32 bases into the low bits of a word. `offset` is only used for errors.
#[inline]
fn pack_word(chunk: &[u8], offset: usize) -> Result<u64> {
    chunk.iter().enumerate().try_fold(0u64, |acc, (i, &b)| -> Result<u64> {
        let v = map_base(b).ok_or(KmerError::InvalidAlphabet {
            symbol: char::from(b),
            position: offset + i,
        })?;
        Ok((acc << 2) | v as u64)
    })
}

impl KmerCodec for PackedCodec {
    fn encode(&self, canonical: &[u8]) -> Result<EncodedKey> {
        let n = canonical.len();
        let len = u16::try_from(n).map_err(|_| KmerError::InvalidLength {
            k: n,
            max: u16::MAX as usize,
        })?;
        let n_words = n.div_ceil(BASES_PER_WORD);
        let mut words = Vec::with_capacity(n_words);
        if n_words > 0 {
            let lead = n - (n_words - 1) * BASES_PER_WORD;
            let (head, tail) = canonical.split_at(lead);
            words.push(pack_word(head, 0)?);
            for (j, chunk) in tail.chunks(BASES_PER_WORD).enumerate() {
                words.push(pack_word(chunk, lead + j * BASES_PER_WORD)?);
            }
        }
        Ok(EncodedKey::Packed {
            len,
            words: words.into_boxed_slice(),
        })
    }

    fn decode(&self, key: &EncodedKey, len: usize) -> Result<Vec<u8>> {
        match key {
            EncodedKey::Packed { len: l, words }
                if *l as usize == len && words.len() == len.div_ceil(BASES_PER_WORD) =>
            {
                Ok((0..len).map(|i| BASES[key.base_code(i) as usize]).collect())
            }
            EncodedKey::Packed { len: l, .. } => Err(KmerError::InvalidKey(format!(
                "packed key holds {l} bases, expected {len}"
            ))),
            EncodedKey::Bytes(_) => {
                Err(KmerError::InvalidKey("byte key given to packed codec".into()))
            }
        }
    }
}

/// Key backend selected at construction time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    /// [`ByteCodec`]
    Bytes,
    /// [`PackedCodec`]
    #[default]
    Packed,
}

impl KmerCodec for Codec {
    fn encode(&self, canonical: &[u8]) -> Result<EncodedKey> {
        match self {
            Codec::Bytes => ByteCodec.encode(canonical),
            Codec::Packed => PackedCodec.encode(canonical),
        }
    }

    fn decode(&self, key: &EncodedKey, len: usize) -> Result<Vec<u8>> {
        match self {
            Codec::Bytes => ByteCodec.decode(key, len),
            Codec::Packed => PackedCodec.decode(key, len),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bytes" | "byte" | "plain" => Ok(Codec::Bytes),
            "packed" | "2bit" => Ok(Codec::Packed),
            other => Err(format!("unknown codec {other:?} (expected bytes|packed)")),
        }
    }
}

// ---------------- Window scanning ----------------

enum Scan {
    /// Rolling forward/rc registers, single-word packed keys (k <= 32).
    Rolling {
        mask: u64,
        fwd: u64,
        rc: u64,
        run: usize,
        next: usize,
    },
    /// Canonicalize each window's text, then encode.
    PerWindow { start: usize },
}

/// Iterator over every window of length `k` in a sequence, yielding the canonical
/// key of each window or `None` when it contains a symbol outside the alphabet.
///
/// Yields `seq.len() - k + 1` items, or none for sequences shorter than `k`.
pub struct CanonicalWindows<'a> {
    seq: &'a [u8],
    k: usize,
    codec: Codec,
    scan: Scan,
}

impl<'a> CanonicalWindows<'a> {
    pub fn new(seq: &'a [u8], k: usize, codec: Codec) -> Self {
        let scan = if codec == Codec::Packed && (1..=BASES_PER_WORD).contains(&k) {
            let mask = if k == BASES_PER_WORD {
                u64::MAX
            } else {
                (1u64 << (2 * k)) - 1
            };
            Scan::Rolling {
                mask,
                fwd: 0,
                rc: 0,
                run: 0,
                next: 0,
            }
        } else {
            Scan::PerWindow { start: 0 }
        };
        CanonicalWindows {
            seq,
            k,
            codec,
            scan,
        }
    }

    /// Number of window positions.
    pub fn window_count(&self) -> usize {
        if self.k == 0 || self.seq.len() < self.k {
            0
        } else {
            self.seq.len() - self.k + 1
        }
    }
}

impl Iterator for CanonicalWindows<'_> {
    type Item = Option<EncodedKey>;

    fn next(&mut self) -> Option<Self::Item> {
        let k = self.k;
        if k == 0 || self.seq.len() < k {
            return None;
        }
        match &mut self.scan {
            Scan::Rolling {
                mask,
                fwd,
                rc,
                run,
                next,
            } => {
                // Feed bases until a full window ends at `next - 1`.
                loop {
                    if *next >= self.seq.len() {
                        return None;
                    }
                    let v_raw = MAP_LUT[self.seq[*next] as usize];
                    *next += 1;
                    if v_raw > 3 {
                        *fwd = 0;
                        *rc = 0;
                        *run = 0;
                    } else {
                        let v = v_raw as u64;
                        *fwd = ((*fwd << 2) | v) & *mask;
                        *rc = (*rc >> 2) | ((v ^ 0b11) << (2 * (k - 1)));
                        *run += 1;
                    }
                    if *next >= k {
                        if *run < k {
                            return Some(None);
                        }
                        let code = (*fwd).min(*rc);
                        return Some(Some(EncodedKey::Packed {
                            len: k as u16,
                            words: Box::new([code]),
                        }));
                    }
                }
            }
            Scan::PerWindow { start } => {
                if *start + k > self.seq.len() {
                    return None;
                }
                let window = &self.seq[*start..*start + k];
                *start += 1;
                Some(self.codec.encode_canonical(window).ok())
            }
        }
    }
}
