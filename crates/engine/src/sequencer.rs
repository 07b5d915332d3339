//! Chunk sequencing
//!
//! Wraps each utterance in a deterministic frame envelope (format header,
//! short digital-silence primer, then payload chunks) and stamps every
//! chunk with a strictly monotonic sequence number, assigned exactly once.
//! Downstream replay (the daemon client resending retained frames after a
//! reported gap) reuses those frames verbatim, so a replayed chunk always
//! carries its original sequence number and the daemon dedups by `seq`.

use lyra_config::constants::stream::SILENCE_PRIMER_MS;
use lyra_core::{wav, AudioFormat, Chunk, SpeechError};

/// Per-utterance chunk sequencer
pub struct ChunkSequencer {
    format: AudioFormat,
    next_seq: u64,
    /// Highest segment id seen; payload chunks may never move backwards
    last_segment: Option<u32>,
    /// Chunk positions within the current segment
    next_chunk_id: u32,
    started: bool,
    finished: bool,
}

impl ChunkSequencer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            next_seq: 0,
            last_segment: None,
            next_chunk_id: 0,
            started: false,
            finished: false,
        }
    }

    /// Emit the envelope: WAV header with placeholder sizes, then ~50 ms of
    /// digital silence. Envelope chunks are tagged to segment 0.
    pub fn start(&mut self) -> Vec<Chunk> {
        debug_assert!(!self.started);
        self.started = true;

        let header = wav::streaming_header(self.format);
        let silence = vec![0u8; self.format.bytes_for_ms(SILENCE_PRIMER_MS)];

        vec![
            self.tag_internal(0, header, false, false),
            self.tag_internal(0, silence, false, false),
        ]
    }

    /// Tag a payload chunk
    ///
    /// Segment ids must be non-decreasing and nothing may follow the
    /// end-of-utterance marker.
    pub fn tag(
        &mut self,
        segment_id: u32,
        bytes: Vec<u8>,
        is_last_of_segment: bool,
        is_last_of_utterance: bool,
    ) -> Result<Chunk, SpeechError> {
        if self.finished {
            return Err(SpeechError::Internal(
                "chunk after end-of-utterance marker".to_string(),
            ));
        }
        if let Some(last) = self.last_segment {
            if segment_id < last {
                return Err(SpeechError::Internal(format!(
                    "segment id moved backwards: {last} -> {segment_id}"
                )));
            }
            if segment_id > last {
                self.next_chunk_id = 0;
            }
        }
        self.last_segment = Some(segment_id);
        self.finished = is_last_of_utterance;

        Ok(self.tag_internal(segment_id, bytes, is_last_of_segment, is_last_of_utterance))
    }

    /// Close the stream with an empty marker chunk; used on failure and
    /// cancellation where the last payload chunk has already left
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let segment_id = self.last_segment.unwrap_or(0);
        Some(self.tag_internal(segment_id, Vec::new(), true, true))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn tag_internal(
        &mut self,
        segment_id: u32,
        bytes: Vec<u8>,
        is_last_of_segment: bool,
        is_last_of_utterance: bool,
    ) -> Chunk {
        let chunk_id = self.next_chunk_id;
        let seq = self.next_seq;
        self.next_chunk_id += 1;
        self.next_seq += 1;

        Chunk {
            segment_id,
            chunk_id,
            seq,
            bytes,
            is_last_of_segment,
            is_last_of_utterance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequencer() -> ChunkSequencer {
        ChunkSequencer::new(AudioFormat::default())
    }

    #[test]
    fn test_envelope_is_header_then_silence() {
        let mut seq = sequencer();
        let envelope = seq.start();

        assert_eq!(envelope.len(), 2);
        assert_eq!(&envelope[0].bytes[0..4], b"RIFF");
        assert_eq!(envelope[0].seq, 0);
        // 50ms of s16le mono 24kHz silence
        assert_eq!(envelope[1].bytes.len(), 2400);
        assert!(envelope[1].bytes.iter().all(|&b| b == 0));
        assert_eq!(envelope[1].seq, 1);
    }

    #[test]
    fn test_seq_strictly_monotonic() {
        let mut seq = sequencer();
        let mut all = seq.start();
        all.push(seq.tag(0, vec![1; 10], false, false).unwrap());
        all.push(seq.tag(0, vec![2; 10], true, false).unwrap());
        all.push(seq.tag(1, vec![3; 10], true, true).unwrap());

        for window in all.windows(2) {
            assert_eq!(window[1].seq, window[0].seq + 1);
        }
    }

    #[test]
    fn test_chunk_id_resets_per_segment() {
        let mut seq = sequencer();
        seq.start();
        seq.tag(0, vec![0], false, false).unwrap();
        seq.tag(0, vec![0], true, false).unwrap();
        let first_of_next = seq.tag(1, vec![0], false, false).unwrap();
        assert_eq!(first_of_next.chunk_id, 0);
    }

    #[test]
    fn test_segment_ids_cannot_regress() {
        let mut seq = sequencer();
        seq.start();
        seq.tag(1, vec![0], true, false).unwrap();
        assert!(seq.tag(0, vec![0], true, false).is_err());
    }

    #[test]
    fn test_nothing_after_last_of_utterance() {
        let mut seq = sequencer();
        seq.start();
        seq.tag(0, vec![0], true, true).unwrap();
        assert!(seq.tag(1, vec![0], false, false).is_err());
        assert!(seq.finish().is_none());
    }

    #[test]
    fn test_finish_emits_single_empty_marker() {
        let mut seq = sequencer();
        seq.start();
        seq.tag(0, vec![9; 4], false, false).unwrap();

        let marker = seq.finish().expect("marker");
        assert!(marker.bytes.is_empty());
        assert!(marker.is_last_of_utterance);
        assert!(seq.finish().is_none());
    }

    #[test]
    fn test_last_of_utterance_appears_exactly_once() {
        let mut seq = sequencer();
        seq.start();
        seq.tag(0, vec![0], true, false).unwrap();
        let last = seq.tag(1, vec![0], true, true).unwrap();
        assert!(last.is_last_of_utterance);
        assert!(seq.is_finished());
    }
}
