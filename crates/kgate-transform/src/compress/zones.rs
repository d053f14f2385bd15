//! Recency partition of a conversation, recomputed from message count.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Zone {
    /// Older than Zone D.
    Expired,
    D,
    C,
    B,
    /// Most recent messages; never rewritten.
    A,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneSizes {
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub d: usize,
}

impl Default for ZoneSizes {
    fn default() -> Self {
        Self {
            a: 10,
            b: 30,
            c: 60,
            d: 120,
        }
    }
}

/// Start indices of each zone. Sizes are cumulative counts from the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zones {
    pub d_start: usize,
    pub c_start: usize,
    pub b_start: usize,
    pub a_start: usize,
    pub len: usize,
}

impl Zones {
    pub fn classify(len: usize, sizes: &ZoneSizes) -> Self {
        let a_start = len.saturating_sub(sizes.a);
        let b_start = len.saturating_sub(sizes.b.max(sizes.a)).min(a_start);
        let c_start = len.saturating_sub(sizes.c.max(sizes.b)).min(b_start);
        let d_start = len.saturating_sub(sizes.d.max(sizes.c)).min(c_start);
        Self {
            d_start,
            c_start,
            b_start,
            a_start,
            len,
        }
    }

    /// Only the last `protected` messages are Zone A; nothing is B, C or D.
    pub fn protect_last(len: usize, protected: usize) -> Self {
        let a_start = len.saturating_sub(protected);
        Self {
            d_start: a_start,
            c_start: a_start,
            b_start: a_start,
            a_start,
            len,
        }
    }

    pub fn zone(&self, index: usize) -> Zone {
        if index >= self.a_start {
            Zone::A
        } else if index >= self.b_start {
            Zone::B
        } else if index >= self.c_start {
            Zone::C
        } else if index >= self.d_start {
            Zone::D
        } else {
            Zone::Expired
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_count_from_the_end() {
        let zones = Zones::classify(200, &ZoneSizes::default());
        assert_eq!(
            (zones.d_start, zones.c_start, zones.b_start, zones.a_start),
            (80, 140, 170, 190)
        );
        assert_eq!(zones.zone(0), Zone::Expired);
        assert_eq!(zones.zone(80), Zone::D);
        assert_eq!(zones.zone(169), Zone::C);
        assert_eq!(zones.zone(189), Zone::B);
        assert_eq!(zones.zone(199), Zone::A);
    }

    #[test]
    fn short_conversations_are_all_zone_a() {
        let zones = Zones::classify(6, &ZoneSizes::default());
        assert!((0..6).all(|index| zones.zone(index) == Zone::A));
    }
}
