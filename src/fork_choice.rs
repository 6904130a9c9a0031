//! Fork resolution
//!
//! A competing branch is described by the height of the last block it shares with the
//! local chain (the fork point) and the blocks it puts on top. Rules, in order:
//! 1. never replace a finalized checkpoint block, and never replace more than
//!    `max_reorg_depth` blocks, unless the competing tip is
//!    `network_recovery_threshold` blocks ahead
//! 2. replacing `attack_reorg_threshold` or more blocks needs the competing proposers to
//!    hold at least 51% of max supply in current balances
//! 3. the competing chain must be better: longer, or equally long with an earlier
//!    first diverging block, or the same timestamp and a lower hash
//! 4. every competing block must validate

use crate::blockchain::{Block, BlockId, Ledger, Sha256Hash};
use crate::crypto::{short_hex, Address};
use crate::economics::{COIN_ATTACK_THRESHOLD_PALS, PALS_PER_TMPL};
use crate::error::ChainError;
use crate::mempool::Mempool;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgOutcome {
    pub fork_height: u64,
    /// Local blocks that were replaced.
    pub depth: u64,
    pub new_tip: Sha256Hash,
    pub readmitted: usize,
}

/// Locate where `blocks` attach to the local chain.
///
/// Leading blocks we already have are skipped. Returns the fork height and the index
/// of the first block that is new to us, or `None` if the first new block's parent is
/// unknown.
pub fn find_fork_point(ledger: &Ledger, blocks: &[Block]) -> Option<(u64, usize)> {
    let first_new = blocks.iter().position(|b| !ledger.contains_block(&b.hash()))?;
    let parent = blocks[first_new].header.previous_hash;
    let ancestor = ledger.get_block(BlockId::Hash(parent))?;
    Some((ancestor.height(), first_new))
}

/// Unique proposers of `branch` and the sum of their current committed balances.
pub fn proposer_stake(ledger: &Ledger, branch: &[Block]) -> (BTreeSet<Address>, u128) {
    let proposers: BTreeSet<Address> = branch.iter().map(|b| b.header.proposer).collect();
    let stake = proposers
        .iter()
        .map(|p| ledger.get_account(p).balance as u128)
        .sum();
    (proposers, stake)
}

/// Order of the local chain against a competing one that shares blocks up to
/// `fork_height`. `Greater` means the competing chain wins.
fn compare_with_local(ledger: &Ledger, fork_height: u64, branch: &[Block]) -> Ordering {
    let competing_tip = fork_height + branch.len() as u64;
    match competing_tip.cmp(&ledger.height()) {
        Ordering::Equal => {}
        other => return other,
    }
    let (Some(theirs), Some(ours)) = (
        branch.first(),
        ledger.get_block(BlockId::Height(fork_height + 1)),
    ) else {
        return Ordering::Less;
    };
    ours.header
        .timestamp
        .cmp(&theirs.header.timestamp)
        .then_with(|| ours.hash().cmp(&theirs.hash()))
}

/// Apply the fork rules without changing anything. Returns the reorg depth.
pub fn evaluate_fork(ledger: &Ledger, fork_height: u64, branch: &[Block]) -> Result<u64, ChainError> {
    let params = ledger.params();
    let local_tip = ledger.height();
    if branch.is_empty() {
        return Err(ChainError::ForkRejected("competing branch is empty".to_string()));
    }
    if fork_height > local_tip {
        return Err(ChainError::ForkRejected(format!(
            "fork point {} is above local tip {}",
            fork_height, local_tip
        )));
    }

    let mut expected_parent = match ledger.get_block(BlockId::Height(fork_height)) {
        Some(block) => block.hash(),
        None => return Err(ChainError::ForkRejected(format!("no local block at {}", fork_height))),
    };
    for (offset, block) in branch.iter().enumerate() {
        if block.header.previous_hash != expected_parent || block.height() != fork_height + 1 + offset as u64 {
            return Err(ChainError::ForkRejected(format!(
                "competing branch is not contiguous at height {}",
                block.height()
            )));
        }
        expected_parent = block.hash();
    }

    let depth = local_tip - fork_height;
    let competing_tip = fork_height + branch.len() as u64;
    let recovery = competing_tip >= local_tip + params.network_recovery_threshold;

    let checkpoint = ledger.latest_checkpoint();
    if fork_height < checkpoint {
        if !recovery {
            return Err(ChainError::ForkRejected(format!(
                "fork at height {} would replace finalized checkpoint {}",
                fork_height, checkpoint
            )));
        }
        warn!(
            "Network recovery: allowing reorg past checkpoint {} ({} blocks ahead)",
            checkpoint,
            competing_tip - local_tip
        );
    }
    if depth > params.max_reorg_depth {
        if !recovery {
            return Err(ChainError::ForkRejected(format!(
                "reorg depth {} exceeds maximum {}",
                depth, params.max_reorg_depth
            )));
        }
        warn!("Network recovery: allowing reorg of depth {}", depth);
    }

    if depth >= params.attack_reorg_threshold {
        let (proposers, stake) = proposer_stake(ledger, branch);
        if stake < COIN_ATTACK_THRESHOLD_PALS as u128 {
            return Err(ChainError::ForkRejected(format!(
                "{}-block reorg backed by {} proposers holding {} TMPL, need {} TMPL",
                depth,
                proposers.len(),
                stake / PALS_PER_TMPL as u128,
                COIN_ATTACK_THRESHOLD_PALS / PALS_PER_TMPL
            )));
        }
        warn!(
            "Deep reorg of {} blocks backed by {} TMPL",
            depth,
            stake / PALS_PER_TMPL as u128
        );
    }

    if compare_with_local(ledger, fork_height, branch) != Ordering::Greater {
        return Err(ChainError::ForkRejected(
            "competing chain is not better than the local chain".to_string(),
        ));
    }

    ledger.validate_branch(fork_height, branch)?;
    Ok(depth)
}

/// Evaluate and, if accepted, switch to the competing branch. Transactions of orphaned
/// blocks go back to the mempool when they are still valid.
pub fn resolve_fork(
    ledger: &mut Ledger,
    mempool: &Mempool,
    fork_height: u64,
    branch: Vec<Block>,
) -> Result<ReorgOutcome, ChainError> {
    let depth = evaluate_fork(ledger, fork_height, &branch)?;

    let included: Vec<Sha256Hash> = branch
        .iter()
        .flat_map(|b| b.transactions.iter().map(|tx| tx.hash()))
        .collect();
    let orphaned = ledger.reorganize(fork_height, branch)?;

    let still_included: BTreeSet<Sha256Hash> = included.iter().copied().collect();
    mempool.on_commit(&included);
    let readmitted = mempool.readmit(
        orphaned
            .into_iter()
            .flat_map(|b| b.transactions)
            .filter(|tx| !still_included.contains(&tx.hash())),
    );

    info!(
        "Switched to competing chain at fork height {} (depth {}), tip {}; {} orphaned txs back in mempool",
        fork_height,
        depth,
        short_hex(&ledger.tip_hash()),
        readmitted
    );
    Ok(ReorgOutcome {
        fork_height,
        depth,
        new_tip: ledger.tip_hash(),
        readmitted,
    })
}
