//! Mentor profiles, approval and availability management.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::Deserialize;
use ulid::Ulid;
use validator::Validate;

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::engine::{open_windows, validate_slot_times, EngineError};
use crate::limits::{MAX_BIO_LEN, MAX_BULK_SLOTS, MAX_EXPERTISE_TAGS, MAX_LIST_LIMIT};
use crate::model::*;
use crate::repo::StoreHandles;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewMentorProfile {
    pub account_id: Ulid,
    #[validate(length(max = 2000))]
    pub bio: String,
    #[validate(length(max = 20))]
    pub expertise: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ProfileUpdate {
    #[validate(length(max = 2000))]
    pub bio: Option<String>,
    #[validate(length(max = 20))]
    pub expertise: Option<Vec<String>>,
}

/// Browse filter. Only approved mentors are ever returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MentorQuery {
    /// Case-insensitive substring of any expertise tag.
    pub expertise: Option<String>,
    pub min_rating: Option<Decimal>,
    pub limit: Option<usize>,
}

impl MentorQuery {
    fn cache_key(&self) -> String {
        format!(
            "expertise={}&min_rating={}&limit={}",
            self.expertise.as_deref().unwrap_or("").to_lowercase(),
            self.min_rating.map(|r| r.to_string()).unwrap_or_default(),
            self.limit.unwrap_or(MAX_LIST_LIMIT)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SlotInput {
    pub schedule: SlotSchedule,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

pub struct MentorService {
    stores: StoreHandles,
    clock: Arc<dyn Clock>,
    search_cache: TtlCache<Vec<Mentor>>,
}

impl MentorService {
    pub fn new(stores: StoreHandles, clock: Arc<dyn Clock>, cache_ttl: std::time::Duration) -> Self {
        Self {
            stores,
            search_cache: TtlCache::new(cache_ttl, clock.clone()),
            clock,
        }
    }

    fn owner_or_admin(actor: &Actor, mentor_id: Ulid) -> Result<(), EngineError> {
        match actor {
            Actor::Admin => Ok(()),
            Actor::Mentor(id) if *id == mentor_id => Ok(()),
            _ => Err(EngineError::Unauthorized("not this mentor's profile")),
        }
    }

    // ── Profiles ─────────────────────────────────────────────

    /// A member applies to mentor. The profile starts unapproved.
    pub async fn create_profile(&self, actor: Actor, profile: NewMentorProfile) -> Result<Mentor, EngineError> {
        if actor != Actor::Mentee(profile.account_id) && actor != Actor::Admin {
            return Err(EngineError::Unauthorized("members create their own mentor profile"));
        }
        profile.validate()?;
        self.insert_profile(profile.account_id, profile.bio, profile.expertise, false)
            .await
    }

    async fn insert_profile(
        &self,
        account_id: Ulid,
        bio: String,
        expertise: Vec<String>,
        approved: bool,
    ) -> Result<Mentor, EngineError> {
        let now = self.clock.now();
        let mentor = self
            .stores
            .mentors
            .insert(Mentor {
                id: Ulid::new(),
                account_id,
                bio: bio.trim().to_string(),
                expertise: normalize_tags(expertise),
                is_approved: approved,
                rating: Decimal::ZERO,
                total_sessions: 0,
                version: 1,
                created_at: now,
                updated_at: now,
            })
            .await?;
        self.search_cache.invalidate_all();
        Ok(mentor)
    }

    /// Mirror a member who was flagged as a mentor elsewhere: create an
    /// approved profile, or approve the one that already exists.
    pub async fn sync_from_member(
        &self,
        account_id: Ulid,
        bio: String,
        expertise: Vec<String>,
    ) -> Result<Mentor, EngineError> {
        if let Some(existing) = self.stores.mentors.by_account(account_id).await? {
            if existing.is_approved {
                return Ok(existing);
            }
            let mentor = self
                .stores
                .mentors
                .compare_and_swap(
                    existing.id,
                    existing.version,
                    MentorPatch {
                        is_approved: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            self.search_cache.invalidate_all();
            tracing::info!(mentor_id = %mentor.id, "mentor approved from member sync");
            return Ok(mentor);
        }
        if expertise.len() > MAX_EXPERTISE_TAGS || bio.chars().count() > MAX_BIO_LEN {
            return Err(EngineError::Validation(format!(
                "bio is limited to {MAX_BIO_LEN} characters and expertise to {MAX_EXPERTISE_TAGS} tags"
            )));
        }
        self.insert_profile(account_id, bio, expertise, true).await
    }

    pub async fn approve(&self, actor: Actor, mentor_id: Ulid, expected_version: u64) -> Result<Mentor, EngineError> {
        if actor != Actor::Admin {
            return Err(EngineError::Unauthorized("only admins approve mentors"));
        }
        let mentor = self
            .stores
            .mentors
            .compare_and_swap(
                mentor_id,
                expected_version,
                MentorPatch {
                    is_approved: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        self.search_cache.invalidate_all();
        tracing::info!(mentor_id = %mentor_id, version = mentor.version, "mentor approved");
        Ok(mentor)
    }

    /// Conditional profile edit. A stale `expected_version` fails with
    /// `VersionConflict` and changes nothing.
    pub async fn update_profile(
        &self,
        actor: Actor,
        mentor_id: Ulid,
        expected_version: u64,
        update: ProfileUpdate,
    ) -> Result<Mentor, EngineError> {
        Self::owner_or_admin(&actor, mentor_id)?;
        update.validate()?;
        let patch = MentorPatch {
            bio: update.bio.map(|b| b.trim().to_string()),
            expertise: update.expertise.map(normalize_tags),
            is_approved: None,
        };
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let mentor = self
            .stores
            .mentors
            .compare_and_swap(mentor_id, expected_version, patch)
            .await?;
        self.search_cache.invalidate_all();
        Ok(mentor)
    }

    pub async fn get(&self, mentor_id: Ulid) -> Result<Mentor, EngineError> {
        self.stores.mentors.get(mentor_id).await
    }

    pub async fn by_account(&self, account_id: Ulid) -> Result<Option<Mentor>, EngineError> {
        self.stores.mentors.by_account(account_id).await
    }

    /// Approved mentors, best rated first. Results may be up to one cache TTL old.
    pub async fn search(&self, query: &MentorQuery) -> Result<Vec<Mentor>, EngineError> {
        let key = query.cache_key();
        if let Some(hit) = self.search_cache.get(&key) {
            return Ok(hit);
        }
        let needle = query.expertise.as_ref().map(|e| e.trim().to_lowercase());
        let mut mentors: Vec<Mentor> = self
            .stores
            .mentors
            .list()
            .await?
            .into_iter()
            .filter(|m| m.is_approved)
            .filter(|m| query.min_rating.is_none_or(|min| m.rating >= min))
            .filter(|m| {
                needle
                    .as_deref()
                    .is_none_or(|n| m.expertise.iter().any(|tag| tag.contains(n)))
            })
            .collect();
        mentors.sort_by(|a, b| {
            b.rating
                .cmp(&a.rating)
                .then(b.total_sessions.cmp(&a.total_sessions))
                .then(a.id.cmp(&b.id))
        });
        mentors.truncate(query.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT));
        self.search_cache.insert(key, mentors.clone());
        Ok(mentors)
    }

    /// Distinct expertise tags across approved mentors, sorted.
    pub async fn expertise_categories(&self) -> Result<Vec<String>, EngineError> {
        let tags: std::collections::BTreeSet<String> = self
            .stores
            .mentors
            .list()
            .await?
            .into_iter()
            .filter(|m| m.is_approved)
            .flat_map(|m| m.expertise)
            .collect();
        Ok(tags.into_iter().collect())
    }

    pub fn purge_cache(&self) -> usize {
        self.search_cache.purge_expired()
    }

    pub async fn reviews(&self, mentor_id: Ulid, limit: usize, offset: usize) -> Result<Vec<Review>, EngineError> {
        self.stores.reviews.list_for_mentor(mentor_id, limit, offset).await
    }

    // ── Availability ─────────────────────────────────────────

    fn check_slot(&self, schedule: &SlotSchedule, start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
        validate_slot_times(start, end)?;
        if let SlotSchedule::Specific { date } = schedule {
            if *date < self.clock.now().date_naive() {
                return Err(EngineError::Validation("slot date is in the past".into()));
            }
        }
        Ok(())
    }

    pub async fn add_slot(&self, actor: Actor, mentor_id: Ulid, input: SlotInput) -> Result<AvailabilitySlot, EngineError> {
        let mut created = self.add_slots(actor, mentor_id, vec![input]).await?;
        created
            .pop()
            .ok_or(EngineError::Validation("no slot created".into()))
    }

    /// All or nothing: one invalid slot rejects the whole batch.
    pub async fn add_slots(
        &self,
        actor: Actor,
        mentor_id: Ulid,
        inputs: Vec<SlotInput>,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        Self::owner_or_admin(&actor, mentor_id)?;
        if inputs.is_empty() {
            return Err(EngineError::Validation("no slots given".into()));
        }
        if inputs.len() > MAX_BULK_SLOTS {
            return Err(EngineError::Validation(format!(
                "at most {MAX_BULK_SLOTS} slots per request"
            )));
        }
        for input in &inputs {
            self.check_slot(&input.schedule, input.start_time, input.end_time)?;
        }
        let now = self.clock.now();
        let slots = inputs
            .into_iter()
            .map(|input| AvailabilitySlot {
                id: Ulid::new(),
                mentor_id,
                schedule: input.schedule,
                start_time: input.start_time,
                end_time: input.end_time,
                is_active: true,
                version: 1,
                created_at: now,
                updated_at: now,
            })
            .collect();
        let created = self.stores.slots.insert_many(mentor_id, slots).await?;
        tracing::info!(mentor_id = %mentor_id, count = created.len(), "availability slots added");
        Ok(created)
    }

    pub async fn update_slot(
        &self,
        actor: Actor,
        slot_id: Ulid,
        expected_version: Option<u64>,
        patch: SlotPatch,
    ) -> Result<AvailabilitySlot, EngineError> {
        let slot = self.stores.slots.get(slot_id).await?;
        Self::owner_or_admin(&actor, slot.mentor_id)?;
        let schedule = patch.schedule.unwrap_or(slot.schedule);
        let start = patch.start_time.unwrap_or(slot.start_time);
        let end = patch.end_time.unwrap_or(slot.end_time);
        self.check_slot(&schedule, start, end)?;
        self.stores.slots.update(slot_id, expected_version, patch).await
    }

    /// Soft delete.
    pub async fn remove_slot(&self, actor: Actor, slot_id: Ulid) -> Result<AvailabilitySlot, EngineError> {
        let slot = self.stores.slots.get(slot_id).await?;
        Self::owner_or_admin(&actor, slot.mentor_id)?;
        self.stores
            .slots
            .update(
                slot_id,
                Some(slot.version),
                SlotPatch {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
    }

    /// Deactivate every slot of `kind` (all kinds when `None`). Returns the count.
    pub async fn clear_slots(&self, actor: Actor, mentor_id: Ulid, kind: Option<SlotKind>) -> Result<usize, EngineError> {
        Self::owner_or_admin(&actor, mentor_id)?;
        let cleared = self.stores.slots.clear(mentor_id, kind).await?;
        tracing::info!(mentor_id = %mentor_id, cleared, kind = ?kind, "availability slots cleared");
        Ok(cleared)
    }

    /// Active slots. With a range, date-specific slots outside it are left out.
    pub async fn list_slots(
        &self,
        mentor_id: Ulid,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let mut slots = self.stores.slots.list_for_mentor(mentor_id, false).await?;
        if let Some((from, to)) = range {
            slots.retain(|s| match s.schedule {
                SlotSchedule::Recurring { .. } => true,
                SlotSchedule::Specific { date } => from <= date && date <= to,
            });
        }
        Ok(slots)
    }

    /// Bookable windows on `date`: active slots minus active bookings.
    pub async fn open_windows(&self, mentor_id: Ulid, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let slots = self.stores.slots.list_for_mentor(mentor_id, false).await?;
        let day_start = date.and_time(NaiveTime::MIN).and_utc();
        let bookings = self
            .stores
            .bookings
            .active_starting_between(
                mentor_id,
                day_start - Duration::minutes(i64::from(crate::limits::MAX_SESSION_MINUTES)),
                day_start + Duration::days(1),
            )
            .await?;
        Ok(open_windows(&slots, &bookings, date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::Engine;
    use crate::model::fixtures::at;
    use chrono::Weekday;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("mentorbook_test_mentor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn service(name: &str) -> (MentorService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(at(2025, 5, 20, 9, 0)));
        let engine = Arc::new(Engine::new(test_wal_path(name), clock.clone(), Default::default()).unwrap());
        let svc = MentorService::new(
            StoreHandles::shared(engine),
            clock.clone(),
            std::time::Duration::from_secs(300),
        );
        (svc, clock)
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn profile_lifecycle_bumps_version_once_per_write() {
        let (svc, _) = service("lifecycle.wal");
        let account = Ulid::new();
        let m = svc
            .create_profile(
                Actor::Mentee(account),
                NewMentorProfile {
                    account_id: account,
                    bio: "  Staff engineer ".into(),
                    expertise: vec!["Rust".into(), "rust".into(), " Systems".into()],
                },
            )
            .await
            .unwrap();
        assert!(!m.is_approved);
        assert_eq!(m.version, 1);
        assert_eq!(m.bio, "Staff engineer");
        assert_eq!(m.expertise, vec!["rust", "systems"]);

        let approved = svc.approve(Actor::Admin, m.id, 1).await.unwrap();
        assert_eq!(approved.version, 2);

        let stale = svc
            .update_profile(
                Actor::Mentor(m.id),
                m.id,
                1,
                ProfileUpdate {
                    bio: Some("new".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(stale, EngineError::VersionConflict { expected: 1, actual: 2, .. }));
        assert_eq!(svc.get(m.id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn only_admins_approve_and_owners_edit() {
        let (svc, _) = service("authz.wal");
        let m = svc.sync_from_member(Ulid::new(), "bio".into(), vec![]).await.unwrap();
        assert!(matches!(
            svc.approve(Actor::Mentor(m.id), m.id, m.version).await,
            Err(EngineError::Unauthorized(_))
        ));
        assert!(matches!(
            svc.update_profile(Actor::Mentor(Ulid::new()), m.id, m.version, ProfileUpdate::default()).await,
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn member_sync_approves_existing_profile() {
        let (svc, _) = service("sync.wal");
        let account = Ulid::new();
        let m = svc
            .create_profile(
                Actor::Mentee(account),
                NewMentorProfile {
                    account_id: account,
                    bio: "bio".into(),
                    expertise: vec![],
                },
            )
            .await
            .unwrap();
        let synced = svc.sync_from_member(account, "ignored".into(), vec![]).await.unwrap();
        assert_eq!(synced.id, m.id);
        assert!(synced.is_approved);
        let again = svc.sync_from_member(account, "ignored".into(), vec![]).await.unwrap();
        assert_eq!(again.version, synced.version);
    }

    #[tokio::test]
    async fn search_filters_and_is_cached() {
        let (svc, clock) = service("search.wal");
        svc.sync_from_member(Ulid::new(), "a".into(), vec!["Backend Rust".into()]).await.unwrap();
        svc.sync_from_member(Ulid::new(), "b".into(), vec!["design".into()]).await.unwrap();
        let account = Ulid::new();
        svc.create_profile(
            Actor::Mentee(account),
            NewMentorProfile {
                account_id: account,
                bio: "pending".into(),
                expertise: vec!["rust".into()],
            },
        )
        .await
        .unwrap();

        let query = MentorQuery {
            expertise: Some("RUST".into()),
            ..Default::default()
        };
        let hits = svc.search(&query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].expertise, vec!["backend rust"]);

        // A new approved mentor is not visible until the cache expires.
        svc.stores
            .mentors
            .insert(Mentor {
                is_approved: true,
                expertise: vec!["rust".into()],
                ..crate::model::fixtures::mentor(Ulid::new())
            })
            .await
            .unwrap();
        assert_eq!(svc.search(&query).await.unwrap().len(), 1);
        clock.advance(Duration::seconds(301));
        assert_eq!(svc.search(&query).await.unwrap().len(), 2);

        let rated = MentorQuery {
            min_rating: Some(Decimal::ONE),
            ..Default::default()
        };
        assert!(svc.search(&rated).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn categories_come_from_approved_mentors_only() {
        let (svc, _) = service("categories.wal");
        svc.sync_from_member(Ulid::new(), "a".into(), vec!["Rust".into(), "interviews".into()])
            .await
            .unwrap();
        svc.sync_from_member(Ulid::new(), "b".into(), vec!["rust".into(), "design".into()])
            .await
            .unwrap();
        let account = Ulid::new();
        svc.create_profile(
            Actor::Mentee(account),
            NewMentorProfile {
                account_id: account,
                bio: "pending".into(),
                expertise: vec!["hidden".into()],
            },
        )
        .await
        .unwrap();

        assert_eq!(
            svc.expertise_categories().await.unwrap(),
            vec!["design", "interviews", "rust"]
        );
    }

    #[tokio::test]
    async fn slots_validate_and_clear_by_kind() {
        let (svc, _) = service("slots.wal");
        let m = svc.sync_from_member(Ulid::new(), "bio".into(), vec![]).await.unwrap();
        let me = Actor::Mentor(m.id);

        let bad = svc
            .add_slot(
                me,
                m.id,
                SlotInput {
                    schedule: SlotSchedule::Recurring { weekday: Weekday::Mon },
                    start_time: t(10, 0),
                    end_time: t(10, 15),
                },
            )
            .await;
        assert!(matches!(bad, Err(EngineError::Validation(_))));

        let past = svc
            .add_slot(
                me,
                m.id,
                SlotInput {
                    schedule: SlotSchedule::Specific {
                        date: NaiveDate::from_ymd_opt(2025, 5, 19).unwrap(),
                    },
                    start_time: t(10, 0),
                    end_time: t(11, 0),
                },
            )
            .await;
        assert!(matches!(past, Err(EngineError::Validation(_))));

        let created = svc
            .add_slots(
                me,
                m.id,
                vec![
                    SlotInput {
                        schedule: SlotSchedule::Recurring { weekday: Weekday::Mon },
                        start_time: t(9, 0),
                        end_time: t(12, 0),
                    },
                    SlotInput {
                        schedule: SlotSchedule::Specific {
                            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                        },
                        start_time: t(10, 0),
                        end_time: t(11, 0),
                    },
                    SlotInput {
                        schedule: SlotSchedule::Specific {
                            date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
                        },
                        start_time: t(10, 0),
                        end_time: t(11, 0),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(created.len(), 3);

        let june = svc
            .list_slots(
                m.id,
                Some((
                    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                    NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
                )),
            )
            .await
            .unwrap();
        assert_eq!(june.len(), 2);

        let removed = svc.remove_slot(me, created[0].id).await.unwrap();
        assert!(!removed.is_active);
        assert_eq!(removed.version, 2);

        assert_eq!(svc.clear_slots(me, m.id, Some(SlotKind::Specific)).await.unwrap(), 2);
        assert!(svc.list_slots(m.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_windows_subtract_bookings() {
        let (svc, _) = service("windows.wal");
        let m = svc.sync_from_member(Ulid::new(), "bio".into(), vec![]).await.unwrap();
        svc.add_slot(
            Actor::Mentor(m.id),
            m.id,
            SlotInput {
                schedule: SlotSchedule::Recurring { weekday: Weekday::Mon },
                start_time: t(9, 0),
                end_time: t(12, 0),
            },
        )
        .await
        .unwrap();
        svc.stores
            .bookings
            .create(NewBooking {
                mentor_id: m.id,
                mentee_id: Ulid::new(),
                scheduled_at: at(2025, 6, 2, 10, 0),
                duration_minutes: 60,
                topic: "Interview prep".into(),
                notes: None,
                mentee_goals: None,
            })
            .await
            .unwrap();

        let windows = svc
            .open_windows(m.id, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(
            windows,
            vec![
                Span::between(at(2025, 6, 2, 9, 0), at(2025, 6, 2, 10, 0)),
                Span::between(at(2025, 6, 2, 11, 0), at(2025, 6, 2, 12, 0)),
            ]
        );
    }
}
