//! Time-partitioned bucket naming for uploads
//!
//! Uploads land in one bucket per week, counted from the Unix epoch. The label
//! of a bucket encodes its week so the retention sweep can decide expiry from
//! the name alone.

use chrono::{DateTime, Duration, TimeDelta, Utc};
use std::sync::{Arc, RwLock};

use crate::storage::BucketName;

/// Prefix shared by every upload bucket label
pub const UPLOAD_BUCKET_PREFIX: &str = "uploads-";

/// Length of one bucket window
pub fn window_length() -> Duration {
    Duration::weeks(1)
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    instant: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Arc::new(RwLock::new(instant)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut guard) = self.instant.write() {
            *guard = instant;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.instant.write() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.instant.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Name of a weekly upload bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadBucketName {
    week: i64,
}

impl UploadBucketName {
    pub fn from_week(week: i64) -> Self {
        Self { week }
    }

    /// Weeks elapsed since the Unix epoch at the start of this window
    pub fn week(&self) -> i64 {
        self.week
    }

    /// Decode a bucket label; labels of non-upload buckets yield `None`
    ///
    /// Only the canonical spelling is accepted (`uploads-0100` is not week
    /// 100) and the week's window must be representable.
    pub fn parse(label: &str) -> Option<Self> {
        let week = label.strip_prefix(UPLOAD_BUCKET_PREFIX)?.parse::<i64>().ok()?;
        let bucket = Self::from_week(week);
        if bucket.label() != label {
            return None;
        }
        bucket.checked_window().map(|_| bucket)
    }

    /// `(start, end)` of the window, or `None` outside chrono's range
    fn checked_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = DateTime::UNIX_EPOCH.checked_add_signed(TimeDelta::try_weeks(self.week)?)?;
        let end = start.checked_add_signed(window_length())?;
        Some((start, end))
    }

    pub fn label(&self) -> String {
        format!("{}{}", UPLOAD_BUCKET_PREFIX, self.week)
    }

    pub fn as_bucket_name(&self) -> BucketName {
        BucketName::new(self.label())
    }

    /// Inclusive start of the window, clamped to the representable range
    pub fn window_start(&self) -> DateTime<Utc> {
        match self.checked_window() {
            Some((start, _)) => start,
            None => self.out_of_range(),
        }
    }

    /// Exclusive end of the window, clamped to the representable range
    pub fn window_end(&self) -> DateTime<Utc> {
        match self.checked_window() {
            Some((_, end)) => end,
            None => self.out_of_range(),
        }
    }

    fn out_of_range(&self) -> DateTime<Utc> {
        if self.week < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        }
    }

    pub fn next(&self) -> Self {
        Self::from_week(self.week.saturating_add(1))
    }
}

/// Maps instants to weekly upload bucket names
#[derive(Clone)]
pub struct BucketNameGenerator {
    clock: Arc<dyn Clock>,
}

impl BucketNameGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Generator driven by wall-clock time
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Bucket of the window containing `instant`
    pub fn bucket_for(&self, instant: DateTime<Utc>) -> UploadBucketName {
        let seconds = instant.timestamp();
        UploadBucketName::from_week(seconds.div_euclid(window_length().num_seconds()))
    }

    /// Bucket of the current window
    pub fn current(&self) -> UploadBucketName {
        self.bucket_for(self.clock.now())
    }

    /// Buckets whose window overlaps `[from, to)`, in ascending order
    pub fn enumerate(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = UploadBucketName> + use<> {
        let first = self.bucket_for(from);
        let last = (to > from).then(|| self.bucket_for(to - Duration::nanoseconds(1)));

        std::iter::successors(last.map(|_| first), move |bucket| Some(bucket.next()))
            .take_while(move |bucket| last.is_some_and(|last| bucket <= &last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn generator(instant: &str) -> (BucketNameGenerator, ManualClock) {
        let clock = ManualClock::new(at(instant));
        (BucketNameGenerator::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_same_window_same_bucket() {
        let (generator, _) = generator("2020-10-30T14:12:00Z");
        // Windows start on Thursdays (the epoch was a Thursday)
        let a = generator.bucket_for(at("2020-10-29T00:00:00Z"));
        let b = generator.bucket_for(at("2020-11-04T23:59:59Z"));
        let c = generator.bucket_for(at("2020-11-05T00:00:00Z"));

        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_eq!(c, a.next());
    }

    #[test]
    fn test_current_follows_clock() {
        let (generator, clock) = generator("2020-10-30T14:12:00Z");
        let first = generator.current();

        clock.advance(Duration::weeks(3));

        assert_eq!(generator.current().week(), first.week() + 3);
    }

    #[test]
    fn test_label_round_trip() {
        let bucket = UploadBucketName::from_week(2652);
        assert_eq!(bucket.label(), "uploads-2652");
        assert_eq!(UploadBucketName::parse("uploads-2652"), Some(bucket));
        assert_eq!(UploadBucketName::parse("default"), None);
        assert_eq!(UploadBucketName::parse("uploads-abc"), None);
        assert_eq!(
            UploadBucketName::parse("uploads--3"),
            Some(UploadBucketName::from_week(-3))
        );
    }

    #[test]
    fn test_non_canonical_labels_rejected() {
        for label in ["uploads-0100", "uploads-+5", "uploads--0", "uploads- 5", "uploads-"] {
            assert_eq!(UploadBucketName::parse(label), None, "{}", label);
        }
    }

    #[test]
    fn test_unrepresentable_weeks_rejected() {
        assert_eq!(UploadBucketName::parse("uploads-99999999999999999"), None);
        assert_eq!(UploadBucketName::parse(&format!("uploads-{}", i64::MAX)), None);
        assert_eq!(UploadBucketName::parse(&format!("uploads-{}", i64::MIN)), None);

        // Constructed directly, the window clamps instead of panicking
        let far = UploadBucketName::from_week(i64::MAX);
        assert_eq!(far.window_end(), DateTime::<Utc>::MAX_UTC);
        assert_eq!(far.next(), far);
        assert_eq!(UploadBucketName::from_week(i64::MIN).window_start(), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_window_bounds() {
        let (generator, _) = generator("2020-10-30T14:12:00Z");
        let bucket = generator.current();

        assert_eq!(bucket.window_start(), at("2020-10-29T00:00:00Z"));
        assert_eq!(bucket.window_end(), at("2020-11-05T00:00:00Z"));
        assert_eq!(generator.bucket_for(bucket.window_start()), bucket);
    }

    #[test]
    fn test_pre_epoch_instants() {
        let (generator, _) = generator("2020-10-30T14:12:00Z");
        let bucket = generator.bucket_for(at("1969-12-31T23:59:59Z"));
        assert_eq!(bucket.week(), -1);
        assert!(bucket.window_end() <= at("1970-01-01T00:00:00Z"));
    }

    #[test]
    fn test_enumerate() {
        let (generator, _) = generator("2020-10-30T14:12:00Z");
        let from = at("2020-10-30T14:12:00Z");
        let to = from + Duration::weeks(3);

        let buckets: Vec<_> = generator.enumerate(from, to).collect();
        assert_eq!(buckets.len(), 4);
        assert_eq!(buckets[0], generator.bucket_for(from));
        assert_eq!(buckets[3], generator.bucket_for(to));
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_enumerate_exclusive_end() {
        let (generator, _) = generator("2020-10-30T14:12:00Z");
        let start = at("2020-10-29T00:00:00Z");

        let buckets: Vec<_> = generator.enumerate(start, start + Duration::weeks(1)).collect();
        assert_eq!(buckets, vec![generator.bucket_for(start)]);

        assert_eq!(generator.enumerate(start, start).count(), 0);
    }
}
