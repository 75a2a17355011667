//! Batch builder (§4.3) — concatenates `common_prefix + item_suffix + "\n"`
//! for a window of items, advancing an index cursor over the item sequence.
//!
//! Accumulate-then-flush shape grounded on
//! `core_render::batch_writer::BatchWriter`: callers push logical units
//! (here, items) and the builder decides internally how they coalesce into
//! one buffer.

use crate::formatter::Formatter;
use crate::metrics::Metrics;
use tracing::warn;

/// Builds formatted-line batches over `items[cursor..]`, one call at a time.
pub struct BatchBuilder<'a, C, I> {
    common_prefix: String,
    items: &'a [I],
    cursor: usize,
    _ctx: std::marker::PhantomData<&'a C>,
}

impl<'a, C, I> BatchBuilder<'a, C, I> {
    /// Formats the common prefix once via `formatter.common(ctx)` and
    /// prepares to walk `items` from the start.
    pub fn new<F: Formatter<C, I>>(
        formatter: &F,
        ctx: &C,
        items: &'a [I],
    ) -> anyhow::Result<Self> {
        Ok(Self {
            common_prefix: formatter.common(ctx)?,
            items,
            cursor: 0,
            _ctx: std::marker::PhantomData,
        })
    }

    /// Total number of items this builder was constructed over.
    pub fn total(&self) -> usize {
        self.items.len()
    }

    /// Items not yet consumed by `next_batch`.
    pub fn remaining(&self) -> usize {
        self.items.len() - self.cursor
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Formats up to `k` items starting at the cursor, invoking
    /// `formatter.item` sequentially (formatter invocations are strictly
    /// sequential per call — §4.3). Items whose formatter call fails are
    /// skipped and counted in `metrics.format_errors`; the batch continues
    /// with the next item (reference policy: skip-and-count).
    ///
    /// Returns the concatenated batch bytes and the number of items actually
    /// consumed (which may be less than `k` near the end of `items`, but is
    /// never reduced by a formatter failure — failed items still advance
    /// the cursor).
    pub fn next_batch<F: Formatter<C, I>>(
        &mut self,
        formatter: &F,
        ctx: &C,
        k: usize,
        mut metrics: Option<&mut Metrics>,
    ) -> (Vec<u8>, usize) {
        let end = (self.cursor + k).min(self.items.len());
        let mut buf = Vec::new();
        let mut consumed = 0;
        for idx in self.cursor..end {
            match formatter.item(ctx, &self.items[idx]) {
                Ok(suffix) => {
                    buf.extend_from_slice(self.common_prefix.as_bytes());
                    buf.extend_from_slice(suffix.as_bytes());
                    buf.push(b'\n');
                }
                Err(err) => {
                    warn!(target: "scoring.batch", item_index = idx, %err, "formatter failed, skipping item");
                    if let Some(m) = metrics.as_deref_mut() {
                        m.format_errors += 1;
                    }
                }
            }
            consumed += 1;
        }
        self.cursor = end;
        (buf, consumed)
    }

    /// Like [`Self::next_batch`], but sized by a byte budget instead of an
    /// item count (§4.5 step 2: "bounded so that its byte length does not
    /// exceed a configurable slab size"). Always consumes at least one item
    /// so the non-blocking scheduler keeps making progress even when a
    /// single formatted line exceeds `max_bytes`.
    pub fn next_batch_bounded_bytes<F: Formatter<C, I>>(
        &mut self,
        formatter: &F,
        ctx: &C,
        max_bytes: usize,
        mut metrics: Option<&mut Metrics>,
    ) -> (Vec<u8>, usize) {
        let mut buf = Vec::new();
        let mut consumed = 0;
        while self.cursor < self.items.len() {
            if !buf.is_empty() && buf.len() >= max_bytes {
                break;
            }
            let idx = self.cursor;
            match formatter.item(ctx, &self.items[idx]) {
                Ok(suffix) => {
                    buf.extend_from_slice(self.common_prefix.as_bytes());
                    buf.extend_from_slice(suffix.as_bytes());
                    buf.push(b'\n');
                }
                Err(err) => {
                    warn!(target: "scoring.batch", item_index = idx, %err, "formatter failed, skipping item");
                    if let Some(m) = metrics.as_deref_mut() {
                        m.format_errors += 1;
                    }
                }
            }
            self.cursor += 1;
            consumed += 1;
        }
        (buf, consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::Formatter;

    struct Doubler;
    impl Formatter<(), i32> for Doubler {
        fn common(&self, _ctx: &()) -> anyhow::Result<String> {
            Ok("|a c1:1.5 ".to_string())
        }
        fn item(&self, _ctx: &(), item: &i32) -> anyhow::Result<String> {
            if *item < 0 {
                anyhow::bail!("negative items are not formattable");
            }
            Ok(format!("|b item{}", item))
        }
    }

    #[test]
    fn builds_batch_with_common_prefix() {
        let items = vec![1, 2, 3];
        let mut builder = BatchBuilder::new(&Doubler, &(), &items).unwrap();
        let (buf, consumed) = builder.next_batch(&Doubler, &(), 2, None);
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(text, "|a c1:1.5 |b item1\n|a c1:1.5 |b item2\n");
        assert_eq!(builder.cursor(), 2);
        assert_eq!(builder.remaining(), 1);
    }

    #[test]
    fn skip_and_count_keeps_cursor_advancing() {
        let items = vec![1, -1, 2];
        let mut metrics = Metrics::new();
        let mut builder = BatchBuilder::new(&Doubler, &(), &items).unwrap();
        let (buf, consumed) = builder.next_batch(&Doubler, &(), 3, Some(&mut metrics));
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(metrics.format_errors, 1);
        assert_eq!(text, "|a c1:1.5 |b item1\n|a c1:1.5 |b item2\n");
        assert_eq!(builder.remaining(), 0);
    }

    #[test]
    fn bounded_bytes_always_makes_progress() {
        let items = vec![1, 2, 3, 4];
        let mut builder = BatchBuilder::new(&Doubler, &(), &items).unwrap();
        // Budget smaller than one line still consumes exactly one item.
        let (buf, consumed) = builder.next_batch_bounded_bytes(&Doubler, &(), 1, None);
        assert_eq!(consumed, 1);
        assert!(!buf.is_empty());
        assert_eq!(builder.remaining(), 3);
    }

    #[test]
    fn bounded_bytes_stops_once_budget_exceeded() {
        let items = vec![1, 2, 3, 4];
        let mut builder = BatchBuilder::new(&Doubler, &(), &items).unwrap();
        let one_line_len = "|a c1:1.5 |b item1\n".len();
        let (_, consumed) =
            builder.next_batch_bounded_bytes(&Doubler, &(), one_line_len * 2, None);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn next_batch_stops_at_end_of_items() {
        let items = vec![1, 2];
        let mut builder = BatchBuilder::new(&Doubler, &(), &items).unwrap();
        let (_, consumed) = builder.next_batch(&Doubler, &(), 10, None);
        assert_eq!(consumed, 2);
        assert_eq!(builder.remaining(), 0);
    }
}
