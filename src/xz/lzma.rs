//! The LZMA range decoder and probability model.
//!
//! One core serves both LZMA2 chunks (inside XZ) and the standalone LZMA1
//! stream ZIP method 14 carries. The decoder works on an in-memory chunk of
//! compressed bytes and writes through a sliding dictionary window; all
//! window and distance arithmetic is bounds-checked so corrupt input cannot
//! read outside the dictionary.

use crate::error::{ArchiveError, Code, Result};

const NUM_STATES: usize = 12;
const NUM_POS_STATES: usize = 16;
/// 1 + kNumFullDistances - kEndPosModelIndex slots of distance-low-bit probs.
const NUM_POS_DECODERS: usize = 115;
const ALIGN_BITS: usize = 4;
const MATCH_MIN_LEN: u32 = 2;

fn bad_data(message: &str) -> ArchiveError {
    ArchiveError::new(Code::CompressionLzmaBadData, message)
}

/// Binary range decoder over a finite compressed chunk.
pub struct RangeDecoder<'a> {
    input: &'a [u8],
    pos: usize,
    range: u32,
    code: u32,
}

impl<'a> RangeDecoder<'a> {
    pub fn new(input: &'a [u8]) -> Result<Self> {
        if input.len() < 5 {
            return Err(bad_data("range coder needs at least 5 bytes"));
        }
        if input[0] != 0 {
            return Err(bad_data("range coder must start with a zero byte"));
        }
        let code = u32::from_be_bytes([input[1], input[2], input[3], input[4]]);
        Ok(RangeDecoder {
            input,
            pos: 5,
            range: u32::MAX,
            code,
        })
    }

    fn next_byte(&mut self) -> Result<u8> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or_else(|| bad_data("range coder ran out of input"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn normalize(&mut self) -> Result<()> {
        if self.range < (1 << 24) {
            self.range <<= 8;
            self.code = (self.code << 8) | u32::from(self.next_byte()?);
        }
        Ok(())
    }

    pub fn decode_bit(&mut self, prob: &mut u16) -> Result<u32> {
        self.normalize()?;
        let bound = (self.range >> 11) * u32::from(*prob);
        if self.code < bound {
            self.range = bound;
            *prob += (2048 - *prob) >> 5;
            Ok(0)
        } else {
            self.range -= bound;
            self.code -= bound;
            *prob -= *prob >> 5;
            Ok(1)
        }
    }

    pub fn decode_direct_bits(&mut self, count: u32) -> Result<u32> {
        let mut result = 0u32;
        for _ in 0..count {
            self.normalize()?;
            self.range >>= 1;
            self.code = self.code.wrapping_sub(self.range);
            let t = 0u32.wrapping_sub(self.code >> 31);
            self.code = self.code.wrapping_add(self.range & t);
            result = (result << 1).wrapping_add(t.wrapping_add(1));
        }
        Ok(result)
    }

    fn bit_tree(&mut self, probs: &mut [u16], bits: u32) -> Result<u32> {
        let mut m = 1usize;
        for _ in 0..bits {
            m = (m << 1) | self.decode_bit(&mut probs[m])? as usize;
        }
        Ok(m as u32 - (1 << bits))
    }

    fn bit_tree_reverse(&mut self, probs: &mut [u16], offset: usize, bits: u32) -> Result<u32> {
        let mut m = 1usize;
        let mut result = 0u32;
        for i in 0..bits {
            let bit = self.decode_bit(&mut probs[offset + m])?;
            m = (m << 1) | bit as usize;
            result |= bit << i;
        }
        Ok(result)
    }

    /// True when every input byte has been consumed and the coder is in the
    /// terminal all-zero state.
    pub fn is_finished(&self) -> bool {
        self.pos == self.input.len() && self.code == 0
    }

    pub fn input_consumed(&self) -> bool {
        self.pos == self.input.len()
    }
}

struct LenDecoder {
    choice: u16,
    choice2: u16,
    low: [[u16; 8]; NUM_POS_STATES],
    mid: [[u16; 8]; NUM_POS_STATES],
    high: [u16; 256],
}

const PROB_INIT: u16 = 1024;

impl LenDecoder {
    fn new() -> Self {
        LenDecoder {
            choice: PROB_INIT,
            choice2: PROB_INIT,
            low: [[PROB_INIT; 8]; NUM_POS_STATES],
            mid: [[PROB_INIT; 8]; NUM_POS_STATES],
            high: [PROB_INIT; 256],
        }
    }

    /// Decoded length minus MATCH_MIN_LEN.
    fn decode(&mut self, rc: &mut RangeDecoder<'_>, pos_state: usize) -> Result<u32> {
        if rc.decode_bit(&mut self.choice)? == 0 {
            rc.bit_tree(&mut self.low[pos_state], 3)
        } else if rc.decode_bit(&mut self.choice2)? == 0 {
            Ok(8 + rc.bit_tree(&mut self.mid[pos_state], 3)?)
        } else {
            Ok(16 + rc.bit_tree(&mut self.high, 8)?)
        }
    }
}

/// Literal context / position parameters decoded from a properties byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaProps {
    pub lc: u32,
    pub lp: u32,
    pub pb: u32,
}

impl LzmaProps {
    /// LZMA2 packing: `prop = (pb * 5 + lp) * 9 + lc`, with `lc + lp ≤ 4`.
    pub fn from_byte(prop: u8) -> Result<Self> {
        if prop >= 225 {
            return Err(bad_data("properties byte out of range"));
        }
        let prop = u32::from(prop);
        let lc = prop % 9;
        let lp = (prop / 9) % 5;
        let pb = prop / 45;
        if lc + lp > 4 {
            return Err(bad_data("lc + lp exceeds 4"));
        }
        if pb > 4 {
            return Err(bad_data("pb exceeds 4"));
        }
        Ok(LzmaProps { lc, lp, pb })
    }
}

/// Sliding dictionary window shared across LZMA2 chunks.
pub struct Window {
    buf: Vec<u8>,
    /// Write head in `buf`.
    pos: usize,
    /// Bytes written since the last dictionary reset, saturating at `buf.len()`.
    filled: usize,
}

impl Window {
    /// Allocates the full dictionary; callers must have vetted `dict_size`
    /// against the limits (pre-flight does this before we are constructed).
    pub fn new(dict_size: usize) -> Self {
        Window {
            buf: vec![0; dict_size.max(1)],
            pos: 0,
            filled: 0,
        }
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.filled = 0;
    }

    pub fn available(&self) -> usize {
        self.filled
    }

    fn last_byte(&self) -> u8 {
        if self.filled == 0 {
            0
        } else if self.pos == 0 {
            self.buf[self.buf.len() - 1]
        } else {
            self.buf[self.pos - 1]
        }
    }

    fn byte_back(&self, dist: usize) -> u8 {
        // dist is 1-based and already validated against `filled`.
        let index = if dist <= self.pos {
            self.pos - dist
        } else {
            self.buf.len() - (dist - self.pos)
        };
        self.buf[index]
    }

    fn push(&mut self, byte: u8, out: &mut Vec<u8>) {
        self.buf[self.pos] = byte;
        self.pos += 1;
        if self.pos == self.buf.len() {
            self.pos = 0;
        }
        self.filled = (self.filled + 1).min(self.buf.len());
        out.push(byte);
    }

    /// Feed literal bytes through the window (uncompressed LZMA2 chunks),
    /// keeping them referenceable by later matches.
    pub fn push_raw(&mut self, byte: u8, out: &mut Vec<u8>) {
        self.push(byte, out);
    }
}

/// Full probability model; reset on LZMA2 state resets.
pub struct LzmaState {
    props: LzmaProps,
    state: usize,
    reps: [u32; 4],
    is_match: [[u16; NUM_POS_STATES]; NUM_STATES],
    is_rep: [u16; NUM_STATES],
    is_rep_g0: [u16; NUM_STATES],
    is_rep_g1: [u16; NUM_STATES],
    is_rep_g2: [u16; NUM_STATES],
    is_rep0_long: [[u16; NUM_POS_STATES]; NUM_STATES],
    pos_slot: [[u16; 64]; 4],
    pos_decoders: [u16; NUM_POS_DECODERS],
    align: [u16; 1 << ALIGN_BITS],
    len: LenDecoder,
    rep_len: LenDecoder,
    literal: Vec<u16>,
}

/// Outcome of decoding until a target output size.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Exactly the requested number of bytes was produced.
    Filled,
    /// The end-of-stream marker appeared (LZMA1 only).
    EndMarker,
}

impl LzmaState {
    pub fn new(props: LzmaProps) -> Self {
        LzmaState {
            props,
            state: 0,
            reps: [0; 4],
            is_match: [[PROB_INIT; NUM_POS_STATES]; NUM_STATES],
            is_rep: [PROB_INIT; NUM_STATES],
            is_rep_g0: [PROB_INIT; NUM_STATES],
            is_rep_g1: [PROB_INIT; NUM_STATES],
            is_rep_g2: [PROB_INIT; NUM_STATES],
            is_rep0_long: [[PROB_INIT; NUM_POS_STATES]; NUM_STATES],
            pos_slot: [[PROB_INIT; 64]; 4],
            pos_decoders: [PROB_INIT; NUM_POS_DECODERS],
            align: [PROB_INIT; 1 << ALIGN_BITS],
            len: LenDecoder::new(),
            rep_len: LenDecoder::new(),
            literal: vec![PROB_INIT; 0x300 << (props.lc + props.lp)],
        }
    }

    /// Reset probabilities, keeping (or replacing) the properties.
    pub fn reset(&mut self, props: LzmaProps) {
        *self = LzmaState::new(props);
    }

    pub fn props(&self) -> LzmaProps {
        self.props
    }

    fn decode_literal(
        &mut self,
        rc: &mut RangeDecoder<'_>,
        window: &Window,
        total_pos: u64,
    ) -> Result<u8> {
        let prev = u32::from(window.last_byte());
        let lp_mask = (1u64 << self.props.lp) - 1;
        let lit_state =
            (((total_pos & lp_mask) as u32) << self.props.lc) + (prev >> (8 - self.props.lc));
        let probs = &mut self.literal[0x300 * lit_state as usize..][..0x300];

        let mut symbol = 1usize;
        if self.state >= 7 {
            // After a match, fold in the byte the match would have copied.
            let dist = self.reps[0] as usize + 1;
            if dist > window.available() {
                return Err(bad_data("match-byte distance exceeds window"));
            }
            let mut match_byte = u32::from(window.byte_back(dist));
            while symbol < 0x100 {
                let match_bit = (match_byte >> 7) & 1;
                match_byte <<= 1;
                let bit =
                    rc.decode_bit(&mut probs[((1 + match_bit as usize) << 8) + symbol])? as usize;
                symbol = (symbol << 1) | bit;
                if match_bit as usize != bit {
                    break;
                }
            }
        }
        while symbol < 0x100 {
            symbol = (symbol << 1) | rc.decode_bit(&mut probs[symbol])? as usize;
        }
        Ok((symbol & 0xFF) as u8)
    }

    fn decode_distance(&mut self, rc: &mut RangeDecoder<'_>, len: u32) -> Result<u32> {
        let len_state = (len.min(3)) as usize;
        let slot = rc.bit_tree(&mut self.pos_slot[len_state], 6)?;
        if slot < 4 {
            return Ok(slot);
        }
        let direct_bits = (slot >> 1) - 1;
        let mut dist = (2 | (slot & 1)) << direct_bits;
        if slot < 14 {
            let offset = dist as usize - slot as usize;
            dist += rc.bit_tree_reverse(&mut self.pos_decoders, offset, direct_bits)?;
        } else {
            dist = dist
                .wrapping_add(rc.decode_direct_bits(direct_bits - ALIGN_BITS as u32)? << ALIGN_BITS);
            dist = dist.wrapping_add(rc.bit_tree_reverse(&mut self.align, 0, ALIGN_BITS as u32)?);
        }
        Ok(dist)
    }

    /// Decode symbols until `want` more bytes of output exist (or, for LZMA1,
    /// the end marker arrives). `total_pos` is the uncompressed position at
    /// entry, used for position context.
    pub fn decode(
        &mut self,
        rc: &mut RangeDecoder<'_>,
        window: &mut Window,
        out: &mut Vec<u8>,
        mut total_pos: u64,
        want: u64,
        dict_size: u64,
    ) -> Result<DecodeOutcome> {
        let target = out.len() as u64 + want;
        let pb_mask = (1u64 << self.props.pb) - 1;

        while (out.len() as u64) < target {
            let pos_state = (total_pos & pb_mask) as usize;
            if rc.decode_bit(&mut self.is_match[self.state][pos_state])? == 0 {
                let byte = self.decode_literal(rc, window, total_pos)?;
                window.push(byte, out);
                total_pos += 1;
                self.state = match self.state {
                    0..=3 => 0,
                    4..=9 => self.state - 3,
                    _ => self.state - 6,
                };
                continue;
            }

            let len;
            if rc.decode_bit(&mut self.is_rep[self.state])? == 0 {
                // New match: shift the rep history and decode a distance.
                len = self.len.decode(rc, pos_state)? + MATCH_MIN_LEN;
                let dist = self.decode_distance(rc, len - MATCH_MIN_LEN)?;
                if dist == u32::MAX {
                    return Ok(DecodeOutcome::EndMarker);
                }
                self.reps = [dist, self.reps[0], self.reps[1], self.reps[2]];
                self.state = if self.state < 7 { 7 } else { 10 };
            } else if rc.decode_bit(&mut self.is_rep_g0[self.state])? == 0 {
                if rc.decode_bit(&mut self.is_rep0_long[self.state][pos_state])? == 0 {
                    // Short rep: single byte at rep0.
                    self.state = if self.state < 7 { 9 } else { 11 };
                    let dist = self.reps[0] as usize + 1;
                    if dist > window.available() {
                        return Err(bad_data("short-rep distance exceeds window"));
                    }
                    let byte = window.byte_back(dist);
                    window.push(byte, out);
                    total_pos += 1;
                    continue;
                }
                len = self.rep_len.decode(rc, pos_state)? + MATCH_MIN_LEN;
                self.state = if self.state < 7 { 8 } else { 11 };
            } else {
                let dist;
                if rc.decode_bit(&mut self.is_rep_g1[self.state])? == 0 {
                    dist = self.reps[1];
                    self.reps[1] = self.reps[0];
                } else if rc.decode_bit(&mut self.is_rep_g2[self.state])? == 0 {
                    dist = self.reps[2];
                    self.reps[2] = self.reps[1];
                    self.reps[1] = self.reps[0];
                } else {
                    dist = self.reps[3];
                    self.reps[3] = self.reps[2];
                    self.reps[2] = self.reps[1];
                    self.reps[1] = self.reps[0];
                }
                self.reps[0] = dist;
                len = self.rep_len.decode(rc, pos_state)? + MATCH_MIN_LEN;
                self.state = if self.state < 7 { 8 } else { 11 };
            }

            // Copy the match.
            let dist = self.reps[0] as u64 + 1;
            if dist > window.available() as u64 || dist > dict_size {
                return Err(bad_data("match distance exceeds dictionary"));
            }
            for _ in 0..len {
                let byte = window.byte_back(dist as usize);
                window.push(byte, out);
            }
            total_pos += u64::from(len);
        }
        Ok(DecodeOutcome::Filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_byte_decoding() {
        // 0x5D = 93: lc=3, lp=0, pb=2 — the classic default.
        let props = LzmaProps::from_byte(93).unwrap();
        assert_eq!(props, LzmaProps { lc: 3, lp: 0, pb: 2 });
        // lc=4, lp=1 would exceed lc+lp ≤ 4: prop = (0*5+1)*9+4 = 13.
        assert!(LzmaProps::from_byte(13).is_err());
        assert!(LzmaProps::from_byte(225).is_err());
    }

    #[test]
    fn window_wraps_and_reads_back() {
        let mut window = Window::new(4);
        let mut out = Vec::new();
        for byte in [1u8, 2, 3, 4, 5, 6] {
            window.push(byte, &mut out);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(window.byte_back(1), 6);
        assert_eq!(window.byte_back(4), 3);
        assert_eq!(window.available(), 4);
    }

    #[test]
    fn range_decoder_requires_leading_zero() {
        assert!(RangeDecoder::new(&[1, 0, 0, 0, 0]).is_err());
        assert!(RangeDecoder::new(&[0, 0, 0]).is_err());
        assert!(RangeDecoder::new(&[0, 0, 0, 0, 0]).is_ok());
    }
}
