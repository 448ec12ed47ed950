//! Per-bucket memory statistics and the post-collection reporter.
//!
//! `object_byte_count` is live bytes after aggregation; `total_byte_count`
//! is everything the bucket holds reserved in blocks. The reporter packs a
//! bucket-name code from the block family and info class, emits one stats
//! record per non-empty bucket, and can dump a fragmentation table.

use crate::heap::object_info::{BucketKind, HeapBlockKind};

/// Raw byte counters, aggregated bucket by bucket.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemStats {
    pub object_byte_count: usize,
    pub total_byte_count: usize,
}

impl MemStats {
    pub fn reset(&mut self) {
        *self = MemStats::default();
    }

    pub fn free_bytes(&self) -> usize {
        self.total_byte_count - self.object_byte_count
    }

    pub fn used_ratio(&self) -> f64 {
        if self.total_byte_count == 0 {
            0.0
        } else {
            self.object_byte_count as f64 / self.total_byte_count as f64
        }
    }

    pub fn aggregate(&mut self, other: &MemStats) {
        self.object_byte_count += other.object_byte_count;
        self.total_byte_count += other.total_byte_count;
    }
}

/// Bucket stats with the block/object counts the fragmentation dump wants.
#[derive(Copy, Clone, Debug, Default)]
pub struct HeapBucketStats {
    pub object_byte_count: usize,
    pub total_byte_count: usize,
    pub total_block_count: usize,
    pub object_count: usize,
    pub finalize_count: usize,
}

impl HeapBucketStats {
    pub fn reset(&mut self) {
        *self = HeapBucketStats::default();
    }

    pub fn mem_stats(&self) -> MemStats {
        MemStats {
            object_byte_count: self.object_byte_count,
            total_byte_count: self.total_byte_count,
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.total_byte_count - self.object_byte_count
    }

    pub fn aggregate(&mut self, other: &HeapBucketStats) {
        self.object_byte_count += other.object_byte_count;
        self.total_byte_count += other.total_byte_count;
        self.total_block_count += other.total_block_count;
        self.object_count += other.object_count;
        self.finalize_count += other.finalize_count;
    }
}

/// One emitted stats record.
#[derive(Copy, Clone, Debug)]
pub struct BucketStatsRecord {
    /// Block family in the high byte, info class in the low byte.
    pub bucket_name_code: u16,
    pub size_cat: u16,
    pub object_bytes: usize,
    pub total_bytes: usize,
}

/// The whole-heap report handed to the host's event sink.
#[derive(Debug, Default)]
pub struct BucketStatsReport {
    pub records: Vec<BucketStatsRecord>,
    pub total: HeapBucketStats,
}

pub const LARGE_BUCKET_NAME_CODE: u16 = 2 << 8;
pub const TOTAL_BUCKET_NAME_CODE: u16 = 3 << 8;

pub fn bucket_name_code(block_kind: HeapBlockKind, bucket_kind: BucketKind) -> u16 {
    bucket_kind.event_code() + (block_kind.event_family_code() << 8)
}

/// Collects per-bucket records and the running total.
pub struct BucketStatsReporter {
    report: BucketStatsReport,
    dump: bool,
}

impl BucketStatsReporter {
    pub fn new(dump: bool) -> Self {
        if dump {
            info!("[FRAG] Post-Collection State");
            info!("                  #Blk   #Objs    #Fin     ObjBytes   FreeBytes  TotalBytes UsedPercent");
        }
        BucketStatsReporter {
            report: BucketStatsReport::default(),
            dump,
        }
    }

    pub fn add(
        &mut self,
        block_kind: HeapBlockKind,
        bucket_kind: BucketKind,
        size_cat: usize,
        stats: &HeapBucketStats,
    ) {
        self.report.total.aggregate(stats);
        if stats.total_byte_count == 0 {
            return;
        }
        let code = if block_kind == HeapBlockKind::Large {
            LARGE_BUCKET_NAME_CODE
        } else {
            bucket_name_code(block_kind, bucket_kind)
        };
        self.report.records.push(BucketStatsRecord {
            bucket_name_code: code,
            size_cat: size_cat as u16,
            object_bytes: stats.object_byte_count,
            total_bytes: stats.total_byte_count,
        });
        if self.dump {
            info!(
                "{:?}/{:?} {:5} : {:5} {:7} {:7} {:12} {:11} {:11} {:10.1}%",
                block_kind,
                bucket_kind,
                size_cat,
                stats.total_block_count,
                stats.object_count,
                stats.finalize_count,
                stats.object_byte_count,
                stats.free_bytes(),
                stats.total_byte_count,
                stats.mem_stats().used_ratio() * 100.0
            );
        }
    }

    pub fn finish(mut self) -> BucketStatsReport {
        let total = self.report.total;
        self.report.records.push(BucketStatsRecord {
            bucket_name_code: TOTAL_BUCKET_NAME_CODE,
            size_cat: 0,
            object_bytes: total.object_byte_count,
            total_bytes: total.total_byte_count,
        });
        if self.dump {
            info!(
                "Total           : {:12} {:11} {:11}",
                total.object_byte_count,
                total.free_bytes(),
                total.total_byte_count
            );
        }
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_code_packs_family_and_class() {
        assert_eq!(
            bucket_name_code(HeapBlockKind::SmallNormal, BucketKind::Normal),
            0
        );
        assert_eq!(
            bucket_name_code(HeapBlockKind::SmallLeaf, BucketKind::Leaf),
            1
        );
        assert_eq!(
            bucket_name_code(HeapBlockKind::MediumFinalizable, BucketKind::Finalizable),
            (1 << 8) | 2
        );
        assert_eq!(LARGE_BUCKET_NAME_CODE, 512);
    }

    #[test]
    fn reporter_totals_and_skips_empty() {
        let mut reporter = BucketStatsReporter::new(false);
        let stats = HeapBucketStats {
            object_byte_count: 100,
            total_byte_count: 4096,
            total_block_count: 1,
            object_count: 5,
            finalize_count: 0,
        };
        reporter.add(HeapBlockKind::SmallNormal, BucketKind::Normal, 32, &stats);
        reporter.add(
            HeapBlockKind::SmallLeaf,
            BucketKind::Leaf,
            32,
            &HeapBucketStats::default(),
        );
        let report = reporter.finish();
        // One real record plus the total line.
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.total.object_byte_count, 100);
        assert_eq!(report.total.total_byte_count, 4096);
        assert_eq!(report.records.last().unwrap().bucket_name_code, TOTAL_BUCKET_NAME_CODE);
    }

    #[test]
    fn mem_stats_ratios() {
        let mut stats = MemStats {
            object_byte_count: 1024,
            total_byte_count: 4096,
        };
        assert_eq!(stats.free_bytes(), 3072);
        assert!((stats.used_ratio() - 0.25).abs() < f64::EPSILON);
        stats.aggregate(&MemStats {
            object_byte_count: 1024,
            total_byte_count: 4096,
        });
        assert_eq!(stats.total_byte_count, 8192);
        stats.reset();
        assert_eq!(stats.total_byte_count, 0);
    }
}
