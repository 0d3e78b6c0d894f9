use crate::error::{Error, Result};

/// One partition of records, numbered from zero in input order.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub index: usize,
    pub records: Vec<T>,
}

/// Fixed-size, order-preserving partitions of a worklist.
///
/// Every batch holds `size` records except the last, which carries the
/// remainder. Batches are handed out lazily so the pipeline can stream
/// them into workers.
#[derive(Debug)]
pub struct Batches<T> {
    items: std::vec::IntoIter<T>,
    size: usize,
    index: usize,
}

/// Partition `items` into batches of `size`. A size of zero is invalid.
pub fn batches<T>(items: Vec<T>, size: usize) -> Result<Batches<T>> {
    if size == 0 {
        return Err(Error::InvalidBatchSize(size));
    }
    Ok(Batches {
        items: items.into_iter(),
        size,
        index: 0,
    })
}

impl<T> Iterator for Batches<T> {
    type Item = Batch<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let records: Vec<T> = self.items.by_ref().take(self.size).collect();
        if records.is_empty() {
            return None;
        }
        let batch = Batch {
            index: self.index,
            records,
        };
        self.index += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.items.len().div_ceil(self.size);
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for Batches<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_with_short_tail() {
        let items: Vec<u32> = (0..120).collect();
        let parts: Vec<Batch<u32>> = batches(items, 50).unwrap().collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].records.len(), 50);
        assert_eq!(parts[1].records.len(), 50);
        assert_eq!(parts[2].records.len(), 20);
        assert_eq!(parts.iter().map(|b| b.index).collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[test]
    fn preserves_input_order() {
        let items: Vec<u32> = (0..7).collect();
        let flattened: Vec<u32> = batches(items, 3)
            .unwrap()
            .flat_map(|b| b.records)
            .collect();
        assert_eq!(flattened, (0..7).collect::<Vec<u32>>());
    }

    #[test]
    fn exact_division_has_no_empty_tail() {
        let items: Vec<u32> = (0..100).collect();
        let parts: Vec<Batch<u32>> = batches(items, 50).unwrap().collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|b| b.records.len() == 50));
    }

    #[test]
    fn oversized_batch_takes_everything() {
        let parts: Vec<Batch<u32>> = batches(vec![1, 2, 3], 50).unwrap().collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].records, vec![1, 2, 3]);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        let parts: Vec<Batch<u32>> = batches(Vec::new(), 50).unwrap().collect();
        assert!(parts.is_empty());
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            batches(vec![1, 2, 3], 0),
            Err(Error::InvalidBatchSize(0))
        ));
    }

    #[test]
    fn reports_exact_length() {
        let iter = batches((0..120).collect::<Vec<u32>>(), 50).unwrap();
        assert_eq!(iter.len(), 3);
    }
}
