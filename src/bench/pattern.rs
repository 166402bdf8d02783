//! Range planning for the three benchmark access patterns
//! (`benchmarks/latency/transfer.h`'s `transferRange` in the original
//! driver). Planning is pure data: it never touches a queue or the
//! controller, so it can be unit-tested without any mapped hardware.

/// Which access pattern a benchmark run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Every queue transfers the same range into its own disjoint pages.
    Repeat,
    /// The total range is divided evenly across queues.
    Sequential,
    /// Every transfer's start LBA is drawn uniformly at random.
    Random,
}

/// One planned, non-random transfer: a fixed range landing at a fixed
/// offset into the shared data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub write: bool,
    pub start_lba: u64,
    pub n_blocks: u32,
    pub n_pages: usize,
    /// Offset, in controller pages, into the shared DMA buffer.
    pub buffer_page_offset: usize,
}

/// A worker's plan for one benchmark run: either a fixed transfer list
/// (repeat/sequential) or the parameters needed to draw a fresh random
/// transfer before each window (random).
#[derive(Debug, Clone)]
pub enum WorkerPlan {
    Fixed(Vec<Transfer>),
    Random {
        namespace_start: u64,
        namespace_blocks: u64,
        transfer_blocks: u32,
        buffer_page_offset: usize,
    },
}

fn transfers_for_range(
    start_block: u64,
    num_blocks: u64,
    block_size: u64,
    page_size: usize,
    max_transfer_blocks: u64,
    write: bool,
    mut buffer_page_offset: usize,
) -> Vec<Transfer> {
    let mut transfers = Vec::new();
    let mut remaining = num_blocks;
    let mut lba = start_block;
    while remaining > 0 {
        let n_blocks = max_transfer_blocks.min(remaining);
        let bytes = n_blocks * block_size;
        let n_pages = ((bytes as usize) + page_size - 1) / page_size;
        transfers.push(Transfer {
            write,
            start_lba: lba,
            n_blocks: n_blocks as u32,
            n_pages,
            buffer_page_offset,
        });
        buffer_page_offset += n_pages;
        lba += n_blocks;
        remaining -= n_blocks;
    }
    transfers
}

/// Plan one [`WorkerPlan`] per queue for `pattern`.
///
/// `max_transfer_blocks` bounds a single command so it never exceeds the
/// controller's max_data_size (spec §4.8: `transfer_blocks =
/// min(controller.max_data_pages_in_blocks, remaining_blocks)`).
pub fn plan_transfers(
    pattern: Pattern,
    n_queues: usize,
    start_block: u64,
    num_blocks: u64,
    block_size: u64,
    page_size: usize,
    max_transfer_blocks: u64,
    write: bool,
) -> Vec<WorkerPlan> {
    assert!(n_queues > 0, "at least one worker queue is required");
    match pattern {
        Pattern::Sequential => {
            let per_queue = num_blocks / n_queues as u64;
            let mut next_offset = 0usize;
            (0..n_queues)
                .map(|i| {
                    let share = if i == n_queues - 1 {
                        num_blocks - per_queue * (n_queues as u64 - 1)
                    } else {
                        per_queue
                    };
                    let worker_start = start_block + per_queue * i as u64;
                    let transfers = transfers_for_range(
                        worker_start,
                        share,
                        block_size,
                        page_size,
                        max_transfer_blocks,
                        write,
                        next_offset,
                    );
                    next_offset += transfers.iter().map(|t| t.n_pages).sum::<usize>();
                    WorkerPlan::Fixed(transfers)
                })
                .collect()
        }
        Pattern::Repeat => {
            let mut next_offset = 0usize;
            (0..n_queues)
                .map(|_| {
                    let transfers = transfers_for_range(
                        start_block,
                        num_blocks,
                        block_size,
                        page_size,
                        max_transfer_blocks,
                        write,
                        next_offset,
                    );
                    next_offset += transfers.iter().map(|t| t.n_pages).sum::<usize>();
                    WorkerPlan::Fixed(transfers)
                })
                .collect()
        }
        Pattern::Random => (0..n_queues)
            .map(|i| WorkerPlan::Random {
                namespace_start: start_block,
                namespace_blocks: num_blocks,
                transfer_blocks: max_transfer_blocks.min(num_blocks) as u32,
                buffer_page_offset: i,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_divides_evenly_with_remainder_on_last_queue() {
        let plans = plan_transfers(Pattern::Sequential, 3, 0, 10, 512, 4096, 1000, false);
        let shares: Vec<u64> = plans
            .into_iter()
            .map(|p| match p {
                WorkerPlan::Fixed(ts) => ts.iter().map(|t| t.n_blocks as u64).sum(),
                WorkerPlan::Random { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(shares, vec![3, 3, 4]);
    }

    #[test]
    fn s6_four_workers_one_transfer_each_of_32_pages() {
        // 1024 blocks / 4 workers = 256 blocks each; blockSize=512,
        // page_size=4096 (8 blocks/page); max_data_pages=32 -> 256 blocks.
        let plans = plan_transfers(Pattern::Sequential, 4, 0, 1024, 512, 4096, 256, false);
        for plan in &plans {
            match plan {
                WorkerPlan::Fixed(ts) => {
                    assert_eq!(ts.len(), 1);
                    assert_eq!(ts[0].n_pages, 32);
                    assert_eq!(ts[0].n_blocks, 256);
                }
                WorkerPlan::Random { .. } => unreachable!(),
            }
        }
    }

    #[test]
    fn repeat_gives_every_queue_the_same_range_in_disjoint_pages() {
        let plans = plan_transfers(Pattern::Repeat, 2, 100, 16, 512, 4096, 1000, false);
        let mut offsets = Vec::new();
        for plan in &plans {
            match plan {
                WorkerPlan::Fixed(ts) => {
                    assert_eq!(ts.len(), 1);
                    assert_eq!(ts[0].start_lba, 100);
                    assert_eq!(ts[0].n_blocks, 16);
                    offsets.push(ts[0].buffer_page_offset);
                }
                WorkerPlan::Random { .. } => unreachable!(),
            }
        }
        assert_ne!(offsets[0], offsets[1], "each queue must land in disjoint pages");
    }

    #[test]
    fn random_plan_assigns_one_designated_page_per_queue() {
        let plans = plan_transfers(Pattern::Random, 3, 0, 1_000_000, 512, 4096, 256, true);
        for (i, plan) in plans.iter().enumerate() {
            match plan {
                WorkerPlan::Random {
                    buffer_page_offset, ..
                } => assert_eq!(*buffer_page_offset, i),
                WorkerPlan::Fixed(_) => unreachable!(),
            }
        }
    }

    #[test]
    fn transfer_size_never_exceeds_max_transfer_blocks() {
        let plans = plan_transfers(Pattern::Repeat, 1, 0, 1000, 512, 4096, 300, false);
        match &plans[0] {
            WorkerPlan::Fixed(ts) => {
                assert_eq!(ts.len(), 4); // 300, 300, 300, 100
                assert!(ts.iter().all(|t| t.n_blocks as u64 <= 300));
                assert_eq!(ts.iter().map(|t| t.n_blocks as u64).sum::<u64>(), 1000);
            }
            WorkerPlan::Random { .. } => unreachable!(),
        }
    }
}
