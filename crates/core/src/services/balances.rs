//! Balance sheet - folds transfers into per-address net balances.

use std::collections::HashMap;

use crate::models::{Address, Balance, BlockRef, TransferEvent};

/// How the receiving side of a transfer is booked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiverAccounting {
    /// Receiver gains the amount.
    #[default]
    Credit,
    /// Receiver loses the amount, like the sender does.
    ///
    /// Reproduces the demo site's fold bit for bit. Balances computed this
    /// way do not match on-chain balances.
    Debit,
}

/// Rules applied when folding a transfer.
#[derive(Debug, Clone, Copy)]
pub struct FoldRules {
    /// Sentinel that marks mints (as sender) and burns (as receiver).
    pub zero_address: Address,
    pub receiver: ReceiverAccounting,
}

impl Default for FoldRules {
    fn default() -> Self {
        Self {
            zero_address: Address::ZERO,
            receiver: ReceiverAccounting::Credit,
        }
    }
}

/// Per-address net balances.
///
/// Entries are independent; the sheet never stores a balance for the
/// configured zero address.
#[derive(Debug, Clone, Default)]
pub struct BalanceSheet {
    balances: HashMap<Address, Balance>,
}

impl BalanceSheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one transfer.
    ///
    /// The sender is debited unless the transfer is a mint; the receiver is
    /// booked per [`ReceiverAccounting`] unless the transfer is a burn.
    /// Unknown addresses start at zero.
    pub fn apply(&mut self, event: &TransferEvent, rules: &FoldRules) {
        let block = event.block();

        if !event.is_mint(&rules.zero_address) {
            self.debit(event.from, event.amount, block);
        }

        if !event.is_burn(&rules.zero_address) {
            match rules.receiver {
                ReceiverAccounting::Credit => self.credit(event.to, event.amount, block),
                ReceiverAccounting::Debit => self.debit(event.to, event.amount, block),
            }
        }
    }

    /// Fold a sequence of transfers in order.
    pub fn apply_all<'a, I>(&mut self, events: I, rules: &FoldRules)
    where
        I: IntoIterator<Item = &'a TransferEvent>,
    {
        for event in events {
            self.apply(event, rules);
        }
    }

    pub fn get(&self, address: &Address) -> Option<&Balance> {
        self.balances.get(address)
    }

    /// Net weight of an address, zero if never seen.
    pub fn weight(&self, address: &Address) -> i128 {
        self.balances.get(address).map_or(0, |b| b.weight)
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Balance> {
        self.balances.values()
    }

    fn credit(&mut self, address: Address, amount: u128, block: BlockRef) {
        let balance = self.entry(address, block);
        balance.weight = balance.weight.saturating_add_unsigned(amount);
        balance.last_block = block;
    }

    fn debit(&mut self, address: Address, amount: u128, block: BlockRef) {
        let balance = self.entry(address, block);
        balance.weight = balance.weight.saturating_sub_unsigned(amount);
        balance.last_block = block;
    }

    fn entry(&mut self, address: Address, block: BlockRef) -> &mut Balance {
        self.balances.entry(address).or_insert(Balance {
            address,
            weight: 0,
            last_block: block,
        })
    }
}
