/// Allocation table for the stream ids of one channel.
///
/// Always hands out the lowest free id. Owned by the channel actor, so it
/// needs no synchronization.
#[derive(Debug)]
pub(crate) struct StreamIdSet {
    words: Vec<u64>,
    capacity: usize,
    in_use: usize,
}

impl StreamIdSet {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.min(i16::MAX as usize + 1);
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
            in_use: 0,
        }
    }

    pub(crate) fn acquire(&mut self) -> Option<i16> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let id = word_idx * 64 + bit;
            if id >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            return Some(id as i16);
        }
        None
    }

    /// Returns `false` if the id was not held.
    pub(crate) fn release(&mut self, id: i16) -> bool {
        if id < 0 || id as usize >= self.capacity {
            return false;
        }
        let (word, bit) = (id as usize / 64, id as usize % 64);
        let mask = 1u64 << bit;
        if self.words[word] & mask == 0 {
            return false;
        }
        self.words[word] &= !mask;
        self.in_use -= 1;
        true
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, id: i16) -> bool {
        if id < 0 || id as usize >= self.capacity {
            return false;
        }
        self.words[id as usize / 64] & (1 << (id as usize % 64)) != 0
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }
}
