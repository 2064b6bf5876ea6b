//! Mapping between article numbers and post dates.
//!
//! Article numbering is only roughly chronological and servers expire
//! articles unevenly, so both directions are approximations:
//! - [`DateLocator::postdate`] resolves the date of an article, probing
//!   nearby numbers when the article itself is gone
//! - [`DateLocator::article_for_date`] binary-searches the server range for
//!   the article posted closest to a goal date, ending on the newer side

use crate::db::Database;
use crate::error::Result;
use crate::nntp::{GroupInfo, OverviewProvider};
use crate::types::GroupId;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Nearby articles tried before a post date falls back to now
const POSTDATE_LOOKUPS: u32 = 21;

/// Upper bound on binary-search steps
const MAX_SEARCH_STEPS: u32 = 64;

/// Perturbation factor bounds for nearby lookups, in thousandths
const NEARBY_FACTOR_MIN: u32 = 1005;
const NEARBY_FACTOR_MAX: u32 = 1012;

/// Resolves article dates and date-to-article lookups for one session
pub struct DateLocator<R = StdRng> {
    rng: R,
}

impl DateLocator<StdRng> {
    /// Locator seeded from the OS
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl Default for DateLocator<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng + Send> DateLocator<R> {
    /// Locator with a caller-supplied random source
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Post date of article `number`, or now when nothing nearby resolves.
    pub async fn postdate(
        &mut self,
        provider: &mut dyn OverviewProvider,
        db: &Database,
        group: GroupId,
        number: u64,
        info: &GroupInfo,
    ) -> Result<DateTime<Utc>> {
        match self.locate(provider, db, group, number, info).await? {
            Some(date) => Ok(date),
            None => {
                tracing::debug!(group = %info.name, number, "No post date found, using now");
                Ok(Utc::now())
            }
        }
    }

    /// Post date of article `number` or of a nearby article.
    ///
    /// Locally ingested articles are answered from the database. Otherwise
    /// the server is asked for the single overview record; when that fails,
    /// the number is scaled by a random factor of 1.005 to 1.012 and the
    /// lookup repeats. The direction is fixed by the starting number: toward
    /// whichever end of the range has more room.
    pub async fn locate(
        &mut self,
        provider: &mut dyn OverviewProvider,
        db: &Database,
        group: GroupId,
        number: u64,
        info: &GroupInfo,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut current = number;
        let upward = roomier_side_is_up(number, info);

        for attempt in 0..POSTDATE_LOOKUPS {
            if let Some(date) = db.local_postdate(group, current).await? {
                return Ok(Some(date));
            }

            match provider.fetch_overview(current, current, false).await {
                Ok(headers) => {
                    if let Some(date) = headers
                        .iter()
                        .find(|h| h.number == current)
                        .and_then(|h| h.date)
                    {
                        return Ok(Some(date));
                    }
                }
                Err(e) => {
                    tracing::debug!(group = %info.name, number = current, error = %e, "Post date lookup failed");
                }
            }

            let next = self.nearby(current, upward, info);
            if next == current {
                break;
            }
            tracing::debug!(
                group = %info.name,
                attempt,
                from = current,
                to = next,
                "Trying nearby article for a post date"
            );
            current = next;
        }

        Ok(None)
    }

    /// Article posted roughly `days` ago
    pub async fn daytopost(
        &mut self,
        provider: &mut dyn OverviewProvider,
        db: &Database,
        group: GroupId,
        info: &GroupInfo,
        days: u32,
    ) -> Result<u64> {
        let goal = Utc::now() - Duration::days(i64::from(days));
        self.article_for_date(provider, db, group, info, goal).await
    }

    /// Article posted closest to `goal`, always within `[info.first, info.last]`.
    ///
    /// Goals older than the oldest article give the oldest article; goals
    /// newer than the newest give the newest. The search stops when it
    /// starts flip-flopping between two candidates on the newer side, when the
    /// bounds collapse, or after a fixed number of steps.
    pub async fn article_for_date(
        &mut self,
        provider: &mut dyn OverviewProvider,
        db: &Database,
        group: GroupId,
        info: &GroupInfo,
        goal: DateTime<Utc>,
    ) -> Result<u64> {
        if info.last <= info.first {
            return Ok(info.first);
        }

        let oldest = self.postdate(provider, db, group, info.first, info).await?;
        if goal <= oldest {
            return Ok(info.first);
        }
        let newest = self.postdate(provider, db, group, info.last, info).await?;
        if goal >= newest {
            return Ok(info.last);
        }

        let (mut low, mut high) = (info.first, info.last);
        let mut wanted = midpoint(low, high);
        let mut previous: Option<u64> = None;

        for step in 0..MAX_SEARCH_STEPS {
            if wanted <= info.first || wanted >= info.last {
                break;
            }

            let before_previous = previous;
            let mut candidate = wanted;
            let mut date = self.locate(provider, db, group, candidate, info).await?;
            if date.is_none() {
                candidate = self.rng.gen_range(low..=high);
                date = self.locate(provider, db, group, candidate, info).await?;
            }
            previous = Some(candidate);

            tracing::debug!(
                group = %info.name,
                step,
                candidate,
                low,
                high,
                date = ?date,
                "Searching article by date"
            );

            match date {
                Some(found) if found == goal => {
                    wanted = candidate;
                    break;
                }
                Some(found) if found > goal => {
                    high = candidate;
                    wanted = midpoint(low, candidate);
                }
                // Unknown dates count as older so the search drifts newer
                _ => {
                    low = candidate;
                    wanted = midpoint(candidate, high);
                }
            }

            if before_previous == Some(wanted) && date.is_some_and(|d| d >= goal) {
                break;
            }
            if high.saturating_sub(low) <= 1 {
                wanted = high;
                break;
            }
        }

        Ok(wanted.clamp(info.first, info.last))
    }

    fn nearby(&mut self, current: u64, upward: bool, info: &GroupInfo) -> u64 {
        let factor = f64::from(self.rng.gen_range(NEARBY_FACTOR_MIN..=NEARBY_FACTOR_MAX)) / 1000.0;
        if upward {
            ((current as f64 * factor).round() as u64).min(info.last)
        } else {
            ((current as f64 / factor).round() as u64).max(info.first)
        }
    }
}

fn roomier_side_is_up(number: u64, info: &GroupInfo) -> bool {
    number.abs_diff(info.first) <= info.last.abs_diff(number)
}

/// Midpoint rounded up
fn midpoint(a: u64, b: u64) -> u64 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    low + (high - low).div_ceil(2)
}
