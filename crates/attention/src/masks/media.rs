//! Media window masks for cross-attention from text to audio embeddings.
//!
//! A text sequence carries media markers at some positions. Every marker
//! owns a window of `window_size` consecutive media slots: marker `i` owns
//! slots `[i * window_size, (i + 1) * window_size)`. The text is cut into
//! segments at the markers:
//!
//! ```text
//! text:     t0 t1 <m> t3 t4 <m> t6
//! segment:  -- -- [0  0  0] [1  1]
//! ```
//!
//! Positions before the first marker form a leading segment with no media
//! index. With `only_attend_immediate_media` a segment sees only its own
//! window; otherwise it sees every window up to and including its own. The
//! leading segment is given window `0` so its softmax stays well defined;
//! in immediate mode its attention is zeroed afterwards (see
//! [`MediaWindows::build_presence_mask`]).
//!
//! When media is cached (incremental decoding), every text position belongs
//! to the segment of the last marker present in the supplied locations.

use std::ops::Range;

use candle_core::{bail, DType, Device, Result, Tensor};

/// Contiguous run of text positions sharing the same media marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    /// Text positions covered by the segment.
    pub text: Range<usize>,
    /// Index of the marker that opened the segment, `None` before the first
    /// marker.
    pub media_index: Option<usize>,
}

/// Positions of the media markers in one sequence.
pub fn marker_positions(markers: &[bool]) -> Vec<usize> {
    markers
        .iter()
        .enumerate()
        .filter_map(|(pos, &is_marker)| is_marker.then_some(pos))
        .collect()
}

/// Splits `text_len` positions into marker segments.
///
/// Without cached media, `markers` must cover exactly `text_len` positions.
/// With cached media it is only used to count how many markers were seen.
pub fn text_segments(
    markers: &[bool],
    text_len: usize,
    use_cached_media: bool,
) -> Result<Vec<TextSegment>> {
    if text_len == 0 {
        return Ok(Vec::new());
    }
    let positions = marker_positions(markers);

    if use_cached_media {
        return Ok(vec![TextSegment {
            text: 0..text_len,
            media_index: positions.len().checked_sub(1),
        }]);
    }

    if markers.len() != text_len {
        bail!(
            "media locations cover {} positions but the text has {text_len}",
            markers.len()
        );
    }

    let mut segments = Vec::with_capacity(positions.len() + 1);
    let first = positions.first().copied().unwrap_or(text_len);
    if first > 0 {
        segments.push(TextSegment {
            text: 0..first,
            media_index: None,
        });
    }
    for (index, &start) in positions.iter().enumerate() {
        let end = positions.get(index + 1).copied().unwrap_or(text_len);
        segments.push(TextSegment {
            text: start..end,
            media_index: Some(index),
        });
    }
    Ok(segments)
}

/// Reads a `[batch, text_len]` marker tensor (any dtype, non-zero = marker)
/// into per-sequence boolean rows.
pub fn locations_from_tensor(media_locations: &Tensor) -> Result<Vec<Vec<bool>>> {
    if media_locations.rank() != 2 {
        bail!(
            "media_locations expected [batch, text_len], got {:?}",
            media_locations.dims()
        );
    }
    let rows = media_locations.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().map(|value| value != 0.0).collect())
        .collect())
}

/// Window assignment policy for media cross-attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaWindows {
    /// Number of media slots owned by each marker.
    pub window_size: usize,
    /// Restrict each segment to its own window instead of all earlier ones.
    pub only_attend_immediate_media: bool,
}

impl MediaWindows {
    pub fn new(window_size: usize, only_attend_immediate_media: bool) -> Result<Self> {
        if window_size == 0 {
            bail!("media window size must be greater than zero");
        }
        Ok(Self {
            window_size,
            only_attend_immediate_media,
        })
    }

    /// Media slots visible to a segment, before clamping to the slot count.
    pub fn window(&self, media_index: Option<usize>) -> Range<usize> {
        let index = media_index.unwrap_or(0);
        let end = index.saturating_add(1).saturating_mul(self.window_size);
        if self.only_attend_immediate_media {
            index.saturating_mul(self.window_size)..end
        } else {
            0..end
        }
    }

    /// Row-major `[text_len, media_len]` keep mask for one sequence.
    pub fn keep_rows(
        &self,
        markers: &[bool],
        text_len: usize,
        media_len: usize,
        use_cached_media: bool,
    ) -> Result<Vec<u8>> {
        let mut data = vec![0u8; text_len * media_len];
        for segment in text_segments(markers, text_len, use_cached_media)? {
            let window = self.window(segment.media_index);
            if window.end > media_len {
                log::warn!(
                    "media window {:?} for marker {:?} exceeds {media_len} media slots; clamping",
                    window,
                    segment.media_index
                );
            }
            let window = window.start.min(media_len)..window.end.min(media_len);
            for pos in segment.text {
                data[pos * media_len + window.start..pos * media_len + window.end].fill(1);
            }
        }
        Ok(data)
    }

    /// Builds the `[batch, text_len, media_len]` keep mask for a batch.
    pub fn build_keep_mask(
        &self,
        device: &Device,
        locations: &[Vec<bool>],
        text_len: usize,
        media_len: usize,
        use_cached_media: bool,
    ) -> Result<Tensor> {
        let mut data = Vec::with_capacity(locations.len() * text_len * media_len);
        for markers in locations {
            data.extend(self.keep_rows(markers, text_len, media_len, use_cached_media)?);
        }
        Tensor::from_vec(data, (locations.len(), text_len, media_len), device)
    }

    /// Builds a `[batch, text_len]` mask that is `1` where a text position
    /// follows at least one marker.
    pub fn build_presence_mask(
        &self,
        device: &Device,
        locations: &[Vec<bool>],
        text_len: usize,
        use_cached_media: bool,
    ) -> Result<Tensor> {
        let mut data = vec![0u8; locations.len() * text_len];
        for (batch, markers) in locations.iter().enumerate() {
            for segment in text_segments(markers, text_len, use_cached_media)? {
                if segment.media_index.is_some() {
                    let row = batch * text_len;
                    data[row + segment.text.start..row + segment.text.end].fill(1);
                }
            }
        }
        Tensor::from_vec(data, (locations.len(), text_len), device)
    }
}
