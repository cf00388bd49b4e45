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

//! Member store
//!
//! Membership types and member records. Registration and renewal of
//! memberships happen outside circulation; circulation only asks whether a
//! membership is currently valid and what limits apply.

use crate::clock::Clock;
use crate::error::{CirculationError, Result};
use crate::storage::models::{Member, MemberProfile, MembershipType, NewMember, NewMembershipType};
use crate::storage::{queries, Database};
use std::sync::Arc;

/// Pool-backed access to members and membership types
#[derive(Debug, Clone)]
pub struct MemberStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

/// Longest loan period a membership type may grant (ten years)
pub const MAX_LOAN_PERIOD_DAYS: i64 = 3650;

impl MemberStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub async fn add_membership_type(&self, membership: &NewMembershipType) -> Result<MembershipType> {
        if !(1..=MAX_LOAN_PERIOD_DAYS).contains(&membership.loan_period_days)
            || membership.max_books < 0
            || membership.max_renewals < 0
        {
            return Err(CirculationError::InvalidInput(format!(
                "membership type {} has invalid limits",
                membership.code
            )));
        }

        let mut conn = self.db.pool().acquire().await?;
        let id = queries::insert_membership_type(&mut conn, membership).await?;
        queries::find_membership_type(&mut conn, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("membership type", id))
    }

    pub async fn add_member(&self, member: &NewMember) -> Result<Member> {
        let mut conn = self.db.pool().acquire().await?;
        if queries::find_membership_type(&mut conn, member.membership_type_id)
            .await?
            .is_none()
        {
            return Err(CirculationError::not_found(
                "membership type",
                member.membership_type_id,
            ));
        }
        let id = queries::insert_member(&mut conn, member).await?;
        queries::find_member(&mut conn, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("member", id))
    }

    pub async fn get_member(&self, id: i64) -> Result<Member> {
        let mut conn = self.db.pool().acquire().await?;
        queries::find_member(&mut conn, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("member", id))
    }

    pub async fn get_member_by_number(&self, member_id: &str) -> Result<Member> {
        let mut conn = self.db.pool().acquire().await?;
        queries::find_member_by_number(&mut conn, member_id)
            .await?
            .ok_or_else(|| CirculationError::not_found("member", member_id))
    }

    /// Member together with their membership limits
    pub async fn get_profile(&self, id: i64) -> Result<MemberProfile> {
        let mut conn = self.db.pool().acquire().await?;
        queries::find_member_profile(&mut conn, id)
            .await?
            .ok_or_else(|| CirculationError::not_found("member", id))
    }

    /// Member active, not expired as of today, and on an active membership type
    pub async fn is_membership_valid(&self, id: i64) -> Result<bool> {
        let profile = self.get_profile(id).await?;
        Ok(profile.can_borrow(self.clock.today()))
    }

    /// Retire or restore a membership type; its members cannot borrow while retired
    pub async fn set_membership_type_active(&self, id: i64, is_active: bool) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        queries::set_membership_type_active(&mut conn, id, is_active).await?;
        tracing::info!(membership_type_id = id, is_active, "membership type activation changed");
        Ok(())
    }

    pub async fn set_active(&self, id: i64, is_active: bool) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        queries::set_member_active(&mut conn, id, is_active).await?;
        tracing::info!(member_id = id, is_active, "member activation changed");
        Ok(())
    }
}
