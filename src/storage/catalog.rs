// Circulation Core - Library circulation domain service
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Catalog store
//!
//! Item and copy records the circulation core reads from and updates. Catalog
//! metadata (authors, publishers, categories) lives elsewhere; this store only
//! carries what lending needs.

use crate::clock::Clock;
use crate::error::{CirculationError, Result};
use crate::storage::models::{CopyStatus, Item, ItemCopy, NewCopy, NewItem};
use crate::storage::{queries, Database};
use std::sync::Arc;

/// Pool-backed access to items and copies
#[derive(Debug, Clone)]
pub struct CatalogStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl CatalogStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub async fn add_item(&self, item: &NewItem) -> Result<Item> {
        let mut conn = self.db.pool().acquire().await?;
        let id = queries::insert_item(&mut conn, item, self.clock.now()).await?;
        queries::find_item(&mut conn, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("item", id))
    }

    pub async fn get_item(&self, id: i64) -> Result<Item> {
        let mut conn = self.db.pool().acquire().await?;
        queries::find_item(&mut conn, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("item", id))
    }

    pub async fn add_copy(&self, copy: &NewCopy) -> Result<ItemCopy> {
        let mut conn = self.db.pool().acquire().await?;
        if queries::find_item(&mut conn, copy.item_id).await?.is_none() {
            return Err(CirculationError::not_found("item", copy.item_id));
        }
        let id = queries::insert_copy(&mut conn, copy).await?;
        queries::find_copy(&mut conn, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("copy", id))
    }

    pub async fn get_copy(&self, id: i64) -> Result<ItemCopy> {
        let mut conn = self.db.pool().acquire().await?;
        queries::find_copy(&mut conn, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("copy", id))
    }

    pub async fn get_copy_by_barcode(&self, barcode: &str) -> Result<ItemCopy> {
        let mut conn = self.db.pool().acquire().await?;
        queries::find_copy_by_barcode(&mut conn, barcode)
            .await?
            .ok_or_else(|| CirculationError::not_found("copy", barcode))
    }

    /// Staff override of a copy's status (repair, withdrawal, found)
    ///
    /// Lending states are owned by circulation: a copy on loan or on the
    /// hold shelf cannot be changed here, and nothing can be moved into
    /// those states. This does not consult the reservation queue; use
    /// `Circulation::set_copy_status` to put a copy back into circulation.
    pub async fn set_copy_status(&self, id: i64, status: CopyStatus) -> Result<ItemCopy> {
        if matches!(status, CopyStatus::CheckedOut | CopyStatus::Reserved) {
            return Err(CirculationError::InvalidState(format!(
                "copy status '{}' is set by circulation only",
                status
            )));
        }

        let mut tx = self.db.begin().await?;
        let copy = queries::find_copy(&mut tx, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("copy", id))?;

        if matches!(copy.status, CopyStatus::CheckedOut | CopyStatus::Reserved) {
            return Err(CirculationError::InvalidState(format!(
                "copy {} is {}; check it in or release the hold first",
                copy.barcode, copy.status
            )));
        }

        if !queries::transition_copy_status(&mut tx, id, copy.status, status).await? {
            return Err(CirculationError::Retryable(format!(
                "copy {} changed concurrently",
                copy.barcode
            )));
        }
        tx.commit().await?;

        tracing::info!(copy_id = id, from = %copy.status, to = %status, "copy status changed");

        Ok(ItemCopy { status, ..copy })
    }

    pub async fn get_item_copies(&self, item_id: i64) -> Result<Vec<ItemCopy>> {
        let mut conn = self.db.pool().acquire().await?;
        queries::list_item_copies(&mut conn, item_id).await
    }

    /// Copies of the item currently on the shelf
    pub async fn available_copies(&self, item_id: i64) -> Result<i64> {
        let mut conn = self.db.pool().acquire().await?;
        queries::count_available_copies(&mut conn, item_id).await
    }
}
