//! Per-destination page sequence with acknowledgement.

use crate::memory::Reservation;
use crate::page::Page;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;

/// A page held by an output buffer.
///
/// Broadcast buffers share one `BufferedPage` between all destinations; the
/// bytes stay charged until the last destination lets go of it.
#[derive(Debug)]
pub(crate) struct BufferedPage {
    data: Bytes,
    _reservation: Option<Reservation>,
}

impl BufferedPage {
    pub(crate) fn new(page: Page) -> Self {
        let (data, reservation) = page.into_parts();
        Self {
            data,
            _reservation: reservation,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Pages returned for one `get_data` call.
#[derive(Debug, Default)]
pub struct BufferData {
    /// Pages starting at `sequence`, in order
    pub pages: Vec<Page>,

    /// Sequence number of the first returned page
    pub sequence: u64,

    /// Sizes of pages still buffered after the returned ones
    pub remaining_bytes: Vec<u64>,

    /// No page follows the returned ones and the producer is done
    pub at_end: bool,
}

impl BufferData {
    /// Sequence number the consumer should ask for next.
    pub fn next_sequence(&self) -> u64 {
        self.sequence + self.pages.len() as u64
    }

    pub fn bytes(&self) -> u64 {
        self.pages.iter().map(Page::size).sum()
    }
}

/// Ordered pages for one destination.
///
/// `sequence` is the sequence number of `pages[0]`. Pages stay here after
/// being handed out until the consumer acknowledges them, so a retried
/// request for the same sequence sees the same pages again.
#[derive(Debug, Default)]
pub(crate) struct DestinationBuffer {
    pages: VecDeque<Arc<BufferedPage>>,
    sequence: u64,
    finished: bool,
}

impl DestinationBuffer {
    pub(crate) fn push(&mut self, page: Arc<BufferedPage>) {
        if !self.finished {
            self.pages.push_back(page);
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of pages at or after `sequence`.
    pub(crate) fn available_from(&self, sequence: u64) -> usize {
        let end = self.sequence + self.pages.len() as u64;
        end.saturating_sub(sequence.max(self.sequence)) as usize
    }

    /// Drop every page before `sequence` and return them so the caller can
    /// settle byte accounting.
    pub(crate) fn acknowledge(&mut self, sequence: u64) -> Vec<Arc<BufferedPage>> {
        let mut removed = Vec::new();
        while self.sequence < sequence {
            match self.pages.pop_front() {
                Some(page) => removed.push(page),
                None => break,
            }
            self.sequence += 1;
        }
        removed
    }

    /// Take everything; the consumer will not ask again.
    pub(crate) fn finish(&mut self) -> Vec<Arc<BufferedPage>> {
        self.finished = true;
        self.sequence += self.pages.len() as u64;
        self.pages.drain(..).collect()
    }

    /// Pages from `sequence` totalling at most `max_bytes`, but always one if
    /// `max_bytes > 0` and a page is available. `max_bytes == 0` only reports
    /// sizes.
    pub(crate) fn get_data(&self, max_bytes: u64, sequence: u64) -> BufferData {
        let start = sequence.max(self.sequence);
        let offset = (start - self.sequence) as usize;

        let mut pages = Vec::new();
        let mut bytes = 0u64;
        let mut idx = offset;
        if max_bytes > 0 {
            while let Some(page) = self.pages.get(idx) {
                if !pages.is_empty() && bytes + page.size() > max_bytes {
                    break;
                }
                bytes += page.size();
                pages.push(Page::with_sequence(
                    page.data.clone(),
                    self.sequence + idx as u64,
                ));
                idx += 1;
            }
        }

        let remaining_bytes = self.pages.iter().skip(idx).map(|p| p.size()).collect();

        BufferData {
            pages,
            sequence: start,
            remaining_bytes,
            at_end: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(size: usize) -> Arc<BufferedPage> {
        Arc::new(BufferedPage::new(Page::zeroed(size)))
    }

    #[test]
    fn test_get_data_respects_max_bytes() {
        let mut dest = DestinationBuffer::default();
        for size in [100, 200, 300] {
            dest.push(page(size));
        }

        let data = dest.get_data(250, 0);
        assert_eq!(data.pages.len(), 1);
        assert_eq!(data.remaining_bytes, vec![200, 300]);

        let data = dest.get_data(500, 0);
        assert_eq!(data.pages.len(), 2);
        assert_eq!(data.next_sequence(), 2);
        assert_eq!(data.remaining_bytes, vec![300]);
    }

    #[test]
    fn test_oversized_page_never_split() {
        let mut dest = DestinationBuffer::default();
        dest.push(page(10_000));
        dest.push(page(10));

        let data = dest.get_data(1_000, 0);
        assert_eq!(data.pages.len(), 1);
        assert_eq!(data.pages[0].size(), 10_000);
        assert_eq!(data.pages[0].sequence(), Some(0));
    }

    #[test]
    fn test_size_probe_returns_no_pages() {
        let mut dest = DestinationBuffer::default();
        dest.push(page(10));
        dest.push(page(20));

        let data = dest.get_data(0, 0);
        assert!(data.pages.is_empty());
        assert_eq!(data.remaining_bytes, vec![10, 20]);
    }

    #[test]
    fn test_retry_sees_same_pages_until_acknowledged() {
        let mut dest = DestinationBuffer::default();
        for size in [1, 2, 3] {
            dest.push(page(size));
        }

        let first = dest.get_data(100, 0);
        let again = dest.get_data(100, 0);
        assert_eq!(first.pages.len(), again.pages.len());

        let removed = dest.acknowledge(2);
        assert_eq!(removed.len(), 2);
        assert_eq!(dest.available_from(2), 1);

        let rest = dest.get_data(100, 2);
        assert_eq!(rest.pages.len(), 1);
        assert_eq!(rest.pages[0].sequence(), Some(2));
        assert_eq!(rest.pages[0].size(), 3);
    }

    #[test]
    fn test_finish_drops_pages_and_later_pushes() {
        let mut dest = DestinationBuffer::default();
        dest.push(page(5));
        assert_eq!(dest.finish().len(), 1);
        assert!(dest.is_finished());

        dest.push(page(5));
        assert_eq!(dest.available_from(0), 0);
    }
}
