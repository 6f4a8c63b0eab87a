//! Batch front end: replays a CSV command file against the engine.
//!
//! This is the crate's outer surface, standing in for the HTTP handlers of a
//! deployed service. Each row resolves its acting user by email into a
//! [`Principal`] and calls the matching engine operation. A row that fails is
//! logged and skipped; the batch keeps going.

use crate::command::{Command, CommandRecord};
use crate::currency::Currency;
use crate::engine::LedgerEngine;
use crate::error::{LedgerError, Result};
use crate::identity::{normalize_email, Principal};
use crate::rates::RateCache;
use crate::store::Store;
use csv::{ReaderBuilder, Trim};
use log::{debug, warn};
use std::io::{Read, Write};
use std::str::FromStr;

/// Counts of what happened to the rows of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub applied: usize,
    pub rejected: usize,

    /// Normalized emails of the users registered by this batch, in row order.
    pub registered: Vec<String>,
}

/// Drives a [`LedgerEngine`] from CSV input and renders its state as CSV.
pub struct BatchRunner<'a, S: Store, C: RateCache> {
    engine: &'a LedgerEngine<S, C>,
}

impl<'a, S: Store, C: RateCache> BatchRunner<'a, S, C> {
    pub fn new(engine: &'a LedgerEngine<S, C>) -> Self {
        BatchRunner { engine }
    }

    /// Processes commands from a CSV reader in streaming fashion.
    ///
    /// Records are read one at a time. Unparseable rows and failed
    /// operations are logged at warn level and skipped.
    pub fn process_csv<R: Read>(&self, reader: R) -> Result<BatchSummary> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut summary = BatchSummary::default();
        for (row_idx, result) in csv_reader.deserialize::<CommandRecord>().enumerate() {
            let row = row_idx + 2; // 1-indexed, accounting for header row

            let outcome = result
                .map_err(LedgerError::from)
                .and_then(|record| {
                    record
                        .parse()
                        .map_err(|message| LedgerError::InvalidCommand { row, message })
                })
                .and_then(|command| self.apply(command, row));

            match outcome {
                Ok(Some(email)) => {
                    summary.applied += 1;
                    summary.registered.push(email);
                }
                Ok(None) => summary.applied += 1,
                Err(e) => {
                    warn!("Row {}: {}", row, e);
                    summary.rejected += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Applies a single parsed command. Returns the email of a newly
    /// registered user.
    fn apply(&self, command: Command, row: usize) -> Result<Option<String>> {
        match command {
            Command::Register { email, full_name } => {
                let registration = self.engine.register(&email, &full_name)?;
                debug!(
                    "Row {}: Registered {} with account {}",
                    row, registration.user.email, registration.account.id
                );
                return Ok(Some(registration.user.email));
            }
            Command::Deposit { email, amount } => {
                let principal = self.principal(&email)?;
                let balance = self.engine.deposit_for(&principal, amount)?;
                debug!("Row {}: Deposited {} for {}, balance {}", row, amount, email, balance);
            }
            Command::Transfer {
                from,
                to,
                amount,
                currency,
            } => {
                let principal = self.principal(&from)?;
                let currency = match currency {
                    Some(code) => Currency::from_str(&code)?,
                    None => self.engine.base_currency(),
                };
                let receipt = self
                    .engine
                    .transfer_by_email(&principal, &to, amount, &currency)?;
                debug!(
                    "Row {}: Transfer {} from {} to {}: {}",
                    row, receipt.record.id, from, to, receipt.record.amount
                );
            }
        }
        Ok(None)
    }

    /// Resolves an acting user. Batch input is trusted, so the email alone
    /// authenticates the row.
    fn principal(&self, email: &str) -> Result<Principal> {
        let email = normalize_email(email)?;
        let user = self
            .engine
            .store()
            .user_by_email(&email)?
            .ok_or(LedgerError::UserNotFound(email))?;
        Ok(Principal::from(&user))
    }

    /// Writes `email,account,balance` for the given users, sorted by email.
    ///
    /// Unknown emails are skipped.
    pub fn write_accounts<W: Write>(&self, emails: &[String], writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["email", "account", "balance"])?;

        let mut emails: Vec<String> = emails
            .iter()
            .filter_map(|e| normalize_email(e).ok())
            .collect();
        emails.sort();
        emails.dedup();

        for email in emails {
            if let Some(account) = self.engine.store().account_by_owner_email(&email)? {
                csv_writer.write_record([
                    email,
                    account.id.to_string(),
                    account.balance.to_string(),
                ])?;
            }
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Writes the transfer history of one user, newest first.
    pub fn write_history<W: Write>(&self, email: &str, writer: W) -> Result<()> {
        let principal = self.principal(email)?;
        let history = self.engine.history_for(&principal)?;

        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["id", "from", "to", "amount", "currency", "created_at"])?;
        for record in history {
            let record = record?;
            csv_writer.write_record([
                record.id.to_string(),
                record.from.to_string(),
                record.to.to_string(),
                record.amount.to_string(),
                record.currency.to_string(),
                record.created_at.to_rfc3339(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(())
    }
}
