//! Checklist task library: parses `- [ ] ...` lines into task records, toggles them
//! (spawning the next occurrence of recurring tasks), writes them back as text, and
//! aggregates many tasks into grouped, counted query results.
//!
//! Every operation here is pure. Callers supply the line text, its location in the
//! document, and the current date; nothing reads a clock or the file system implicitly
//! except `TaskSettings::load`.

pub mod core {
    use crate::recurrence::RecurrenceRule;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::path::PathBuf;

    /* ------------------------------ Status ------------------------------ */

    /// Normalized completion state. The toggle state machine only reasons about these two.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum Status {
        Todo,
        Done,
    }

    impl Status {
        /// `' '` is the only open marker; anything else counts as completed.
        pub fn from_marker(c: char) -> Self {
            if c == ' ' { Status::Todo } else { Status::Done }
        }

        /// Marker written when the status is set by a toggle.
        pub fn canonical_marker(self) -> char {
            match self {
                Status::Todo => ' ',
                Status::Done => 'x',
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                Status::Todo => "Todo",
                Status::Done => "Done",
            }
        }
    }

    /// The raw bracket character, classified. `Other` covers marker schemes such as `[/]`
    /// or `[-]`; they normalize to `Status::Done`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum StatusMarker {
        Todo,
        Done,
        Other(char),
    }

    impl StatusMarker {
        pub fn from_char(c: char) -> Self {
            match c {
                ' ' => StatusMarker::Todo,
                'x' | 'X' => StatusMarker::Done,
                other => StatusMarker::Other(other),
            }
        }

        pub fn status(self) -> Status {
            match self {
                StatusMarker::Todo => Status::Todo,
                StatusMarker::Done | StatusMarker::Other(_) => Status::Done,
            }
        }
    }

    /* ------------------------------ Location ------------------------------ */

    /// Where a line lives: supplied by the caller, never validated here.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct LineContext {
        pub path: String,
        /// Line number of the heading that opens the section (0 before any heading).
        pub section_start: usize,
        /// Position of the task among the tasks of its section.
        pub section_index: usize,
        pub preceding_header: Option<String>,
    }

    impl LineContext {
        /// Context for editor actions, where only the document path matters.
        pub fn for_path(path: impl Into<String>) -> Self {
            Self {
                path: path.into(),
                ..Self::default()
            }
        }
    }

    /* ------------------------------ Entity ------------------------------ */

    /// One checklist item.
    ///
    /// Tasks are values: `toggle` returns new tasks instead of changing the receiver.
    /// A parsed task remembers its source line and serializes to it verbatim until a
    /// field is changed; code that edits fields in place must call `mark_dirty`.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub status: Status,
        /// Literal character between the brackets, kept even when `status` loses detail.
        pub original_status_character: char,
        pub description: String,
        pub path: String,
        /// Leading whitespace before the list marker.
        pub indentation: String,
        /// `-` or `*`.
        pub list_marker: char,
        pub due_date: Option<NaiveDate>,
        pub done_date: Option<NaiveDate>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        pub recurrence_rule: Option<RecurrenceRule>,
        /// Trailing `^block-id`, without the caret.
        #[serde(default)]
        pub block_link: Option<String>,
        #[serde(default)]
        pub section_start: usize,
        #[serde(default)]
        pub section_index: usize,
        #[serde(default)]
        pub preceding_header: Option<String>,

        /// Line the task was parsed from; written back untouched while the task is clean.
        #[serde(skip_serializing, skip_deserializing)]
        pub source_line: Option<String>,
    }

    impl Task {
        /// An open task with no dates, placed at `context`.
        pub fn new(description: impl Into<String>, context: &LineContext) -> Self {
            Self {
                status: Status::Todo,
                original_status_character: ' ',
                description: description.into(),
                path: context.path.clone(),
                indentation: String::new(),
                list_marker: '-',
                due_date: None,
                done_date: None,
                recurrence_rule: None,
                block_link: None,
                section_start: context.section_start,
                section_index: context.section_index,
                preceding_header: context.preceding_header.clone(),
                source_line: None,
            }
        }

        /// Empty stand-in used when a line cannot be decomposed at all.
        pub fn placeholder(path: &str) -> Self {
            Self::new("", &LineContext::for_path(path))
        }

        pub fn marker(&self) -> StatusMarker {
            StatusMarker::from_char(self.original_status_character)
        }

        pub fn is_done(&self) -> bool {
            self.status == Status::Done
        }

        pub fn is_recurring(&self) -> bool {
            self.recurrence_rule.is_some()
        }

        pub fn context(&self) -> LineContext {
            LineContext {
                path: self.path.clone(),
                section_start: self.section_start,
                section_index: self.section_index,
                preceding_header: self.preceding_header.clone(),
            }
        }

        /// Forget the source line so the next serialization renders the fields.
        pub fn mark_dirty(&mut self) {
            self.source_line = None;
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum TaskError {
        #[error("invalid recurrence rule {text:?}: {reason}")]
        InvalidRecurrence { text: String, reason: String },
        #[error("do not understand query instruction: {0}")]
        UnknownInstruction(String),
        #[error("invalid date {0:?} in query")]
        InvalidDate(String),
        #[error("invalid limit {0:?} in query")]
        InvalidLimit(String),
        #[error("reading settings from {path:?}")]
        SettingsIo {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("parsing settings from {path:?}: {source}")]
        SettingsParse {
            path: PathBuf,
            #[source]
            source: toml::de::Error,
        },
    }
}

pub mod settings {
    //! User-facing configuration, loaded from TOML.

    use crate::core::TaskError;
    use serde::{Deserialize, Serialize};
    use std::{fs, io, path::Path};

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TaskSettings {
        /// When non-empty, only checklist lines containing this text are tasks
        /// (e.g. `#task`). Other checklist lines stay plain checklist items.
        pub global_filter: String,
    }

    impl TaskSettings {
        pub fn with_global_filter(filter: impl Into<String>) -> Self {
            Self {
                global_filter: filter.into(),
            }
        }

        /// Load settings from `path`, falling back to defaults when the file does not exist.
        pub fn load(path: &Path) -> Result<Self, TaskError> {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
                Err(source) => {
                    return Err(TaskError::SettingsIo {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            };
            toml::from_str(&text).map_err(|source| TaskError::SettingsParse {
                path: path.to_path_buf(),
                source,
            })
        }

        pub fn matches_global_filter(&self, line: &str) -> bool {
            self.global_filter.is_empty() || line.contains(&self.global_filter)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn missing_file_yields_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let settings = TaskSettings::load(&tmp.path().join("absent.toml")).expect("load");
            assert_eq!(settings, TaskSettings::default());
        }

        #[test]
        fn reads_global_filter_from_toml() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("tasks.toml");
            fs::write(&path, "global_filter = \"#task\"\n").expect("write");
            let settings = TaskSettings::load(&path).expect("load");
            assert_eq!(settings.global_filter, "#task");
            assert!(settings.matches_global_filter("- [ ] #task buy milk"));
            assert!(!settings.matches_global_filter("- [ ] buy milk"));
        }

        #[test]
        fn malformed_toml_is_reported() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("tasks.toml");
            fs::write(&path, "global_filter = [").expect("write");
            let err = TaskSettings::load(&path).unwrap_err();
            assert!(matches!(err, TaskError::SettingsParse { .. }));
        }
    }
}

pub mod recurrence {
    //! Recurrence rules (`every 2 weeks on Monday`) and the calendar arithmetic that
    //! advances a due date to the next occurrence.
    //!
    //! Rules are parsed with `nom` from lowercase text and rendered canonically by
    //! `Display`. `next_after` is pure: same rule and reference date, same answer.

    use crate::core::TaskError;
    use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::tag,
        character::complete::{alpha1, char, digit1, space0, space1},
        combinator::{all_consuming, map, map_res, opt, value},
        error::{VerboseError, VerboseErrorKind},
        multi::separated_list1,
        sequence::{preceded, terminated, tuple},
    };
    use std::{fmt, str::FromStr};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const MAX_MONTH_STEPS: u32 = 96;
    const MAX_YEAR_STEPS: i32 = 100;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Frequency {
        Daily,
        Weekly,
        Monthly,
        Yearly,
    }

    impl Frequency {
        fn unit(self) -> &'static str {
            match self {
                Frequency::Daily => "day",
                Frequency::Weekly => "week",
                Frequency::Monthly => "month",
                Frequency::Yearly => "year",
            }
        }
    }

    /// Day-of-month anchor for monthly rules.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MonthDay {
        Day(u32),
        Last,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct RecurrenceRule {
        frequency: Frequency,
        interval: u32,
        /// Monday-first, deduplicated. Only meaningful for weekly rules.
        weekdays: Vec<Weekday>,
        month_day: Option<MonthDay>,
    }

    impl RecurrenceRule {
        /// `every <interval> <frequency>`; an interval of 0 is treated as 1.
        pub fn every(frequency: Frequency, interval: u32) -> Self {
            Self {
                frequency,
                interval: interval.max(1),
                weekdays: vec![],
                month_day: None,
            }
        }

        /// Restrict a weekly rule to the given weekdays.
        pub fn on_weekdays(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
            let mut days: Vec<Weekday> = days.into_iter().collect();
            days.sort_by_key(|d| d.num_days_from_monday());
            days.dedup();
            self.weekdays = days;
            self
        }

        /// Anchor a monthly rule to a day of the month.
        pub fn on_month_day(mut self, day: MonthDay) -> Self {
            self.month_day = Some(day);
            self
        }

        pub fn frequency(&self) -> Frequency {
            self.frequency
        }

        pub fn interval(&self) -> u32 {
            self.interval
        }

        pub fn weekdays(&self) -> &[Weekday] {
            &self.weekdays
        }

        pub fn month_day(&self) -> Option<MonthDay> {
            self.month_day
        }

        /// First date strictly after `reference` that the rule produces.
        ///
        /// `None` only when the answer would fall outside the representable calendar
        /// or no matching date exists within the search horizon (e.g. the 31st in a
        /// rule that only ever lands on 30-day months).
        pub fn next_after(&self, reference: NaiveDate) -> Option<NaiveDate> {
            let n = self.interval;
            match self.frequency {
                Frequency::Daily => reference.checked_add_days(Days::new(u64::from(n))),
                Frequency::Weekly if self.weekdays.is_empty() => {
                    reference.checked_add_days(Days::new(7 * u64::from(n)))
                }
                Frequency::Weekly => self.next_weekday(reference),
                Frequency::Monthly => self.next_month(reference),
                Frequency::Yearly => self.next_year(reference),
            }
        }

        fn next_weekday(&self, reference: NaiveDate) -> Option<NaiveDate> {
            let today = reference.weekday().num_days_from_monday();
            if let Some(later) = self
                .weekdays
                .iter()
                .map(|d| d.num_days_from_monday())
                .find(|d| *d > today)
            {
                return reference.checked_add_days(Days::new(u64::from(later - today)));
            }
            // Weekdays are Monday-first, so the first one opens the next matching week.
            let first = self.weekdays.first()?.num_days_from_monday();
            week_start(reference)?
                .checked_add_days(Days::new(7 * u64::from(self.interval)))?
                .checked_add_days(Days::new(u64::from(first)))
        }

        fn next_month(&self, reference: NaiveDate) -> Option<NaiveDate> {
            // An anchored rule may still land later in the reference month.
            let first_step = if self.month_day.is_some() { 0 } else { 1 };
            for step in first_step..=MAX_MONTH_STEPS {
                let months = step.checked_mul(self.interval)?;
                let (year, month) = shift_month(reference.year(), reference.month(), months)?;
                let day = match self.month_day {
                    None => reference.day(),
                    Some(MonthDay::Day(d)) => d,
                    Some(MonthDay::Last) => last_day_of_month(year, month)?,
                };
                if let Some(candidate) = NaiveDate::from_ymd_opt(year, month, day) {
                    if candidate > reference {
                        return Some(candidate);
                    }
                }
            }
            None
        }

        fn next_year(&self, reference: NaiveDate) -> Option<NaiveDate> {
            let n = i32::try_from(self.interval).ok()?;
            for step in 1..=MAX_YEAR_STEPS {
                let year = reference.year().checked_add(step.checked_mul(n)?)?;
                if let Some(candidate) =
                    NaiveDate::from_ymd_opt(year, reference.month(), reference.day())
                {
                    return Some(candidate);
                }
            }
            None
        }
    }

    fn week_start(day: NaiveDate) -> Option<NaiveDate> {
        day.checked_sub_days(Days::new(u64::from(day.weekday().num_days_from_monday())))
    }

    fn shift_month(year: i32, month: u32, by: u32) -> Option<(i32, u32)> {
        let total = i64::from(year) * 12 + i64::from(month) - 1 + i64::from(by);
        let year = i32::try_from(total.div_euclid(12)).ok()?;
        let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
        Some((year, month))
    }

    fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = first.checked_add_months(Months::new(1))?;
        next.pred_opt().map(|d| d.day())
    }

    /* ------------------------------ Text form ------------------------------ */

    impl fmt::Display for RecurrenceRule {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let unit = self.frequency.unit();
            if self.interval == 1 {
                write!(f, "every {unit}")?;
            } else {
                write!(f, "every {} {unit}s", self.interval)?;
            }
            if !self.weekdays.is_empty() {
                let names: Vec<&str> = self.weekdays.iter().map(|d| weekday_name(*d)).collect();
                write!(f, " on {}", names.join(", "))?;
            }
            match self.month_day {
                Some(MonthDay::Day(d)) => write!(f, " on the {d}{}", ordinal_suffix(d))?,
                Some(MonthDay::Last) => f.write_str(" on the last")?,
                None => {}
            }
            Ok(())
        }
    }

    impl FromStr for RecurrenceRule {
        type Err = TaskError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let normalized = s.trim().to_lowercase();
            match all_consuming(rule)(normalized.as_str()) {
                Ok((_, rule)) => Ok(rule),
                Err(err) => Err(TaskError::InvalidRecurrence {
                    text: s.trim().to_string(),
                    reason: describe_error(err),
                }),
            }
        }
    }

    fn describe_error(err: nom::Err<VerboseError<&str>>) -> String {
        match err {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => match ve.errors.first() {
                Some((rest, VerboseErrorKind::Context(ctx))) if !rest.is_empty() => {
                    format!("bad {ctx} at {rest:?}")
                }
                Some((rest, _)) if !rest.is_empty() => format!("unexpected {rest:?}"),
                _ => "incomplete rule".to_string(),
            },
            nom::Err::Incomplete(_) => "incomplete rule".to_string(),
        }
    }

    fn rule(i: &str) -> PResult<'_, RecurrenceRule> {
        let (i, _) = tag("every")(i)?;
        let (i, _) = space1(i)?;
        let before_interval = i;
        let (i, interval) =
            opt(terminated(map_res(digit1, |s: &str| s.parse::<u32>()), space1))(i)?;
        if interval == Some(0) {
            return Err(nom::Err::Failure(VerboseError {
                errors: vec![(before_interval, VerboseErrorKind::Context("interval"))],
            }));
        }
        let (i, frequency) = frequency(i)?;
        let mut rule = RecurrenceRule::every(frequency, interval.unwrap_or(1));
        let i = match frequency {
            Frequency::Weekly => {
                let (i, days) =
                    opt(preceded(tuple((space1, tag("on"), space1)), weekday_list))(i)?;
                rule = rule.on_weekdays(days.unwrap_or_default());
                i
            }
            Frequency::Monthly => {
                let (i, day) = opt(preceded(
                    tuple((space1, tag("on"), space1, tag("the"), space1)),
                    month_day,
                ))(i)?;
                if let Some(day) = day {
                    rule = rule.on_month_day(day);
                }
                i
            }
            Frequency::Daily | Frequency::Yearly => i,
        };
        let (i, _) = space0(i)?;
        Ok((i, rule))
    }

    fn frequency(i: &str) -> PResult<'_, Frequency> {
        alt((
            value(Frequency::Daily, alt((tag("days"), tag("day")))),
            value(Frequency::Weekly, alt((tag("weeks"), tag("week")))),
            value(Frequency::Monthly, alt((tag("months"), tag("month")))),
            value(Frequency::Yearly, alt((tag("years"), tag("year")))),
        ))(i)
    }

    fn weekday_list(i: &str) -> PResult<'_, Vec<Weekday>> {
        separated_list1(list_separator, weekday)(i)
    }

    fn list_separator(i: &str) -> PResult<'_, ()> {
        alt((
            map(
                tuple((space0, char(','), space0, opt(terminated(tag("and"), space1)))),
                |_| (),
            ),
            map(tuple((space1, tag("and"), space1)), |_| ()),
        ))(i)
    }

    fn weekday(i: &str) -> PResult<'_, Weekday> {
        let (rest, word) = alpha1(i)?;
        match weekday_from_word(word) {
            Some(day) => Ok((rest, day)),
            None => Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("weekday"))],
            })),
        }
    }

    fn month_day(i: &str) -> PResult<'_, MonthDay> {
        alt((
            value(MonthDay::Last, tag("last")),
            map_res(
                terminated(
                    digit1,
                    opt(alt((tag("st"), tag("nd"), tag("rd"), tag("th")))),
                ),
                |s: &str| match s.parse::<u32>() {
                    Ok(d) if (1..=31).contains(&d) => Ok(MonthDay::Day(d)),
                    _ => Err("day of month out of range"),
                },
            ),
        ))(i)
    }

    fn weekday_from_word(word: &str) -> Option<Weekday> {
        let word = word.strip_suffix('s').filter(|w| w.ends_with("day")).unwrap_or(word);
        Some(match word {
            "monday" | "mon" => Weekday::Mon,
            "tuesday" | "tue" | "tues" => Weekday::Tue,
            "wednesday" | "wed" => Weekday::Wed,
            "thursday" | "thu" | "thurs" => Weekday::Thu,
            "friday" | "fri" => Weekday::Fri,
            "saturday" | "sat" => Weekday::Sat,
            "sunday" | "sun" => Weekday::Sun,
            _ => return None,
        })
    }

    fn weekday_name(day: Weekday) -> &'static str {
        match day {
            Weekday::Mon => "Monday",
            Weekday::Tue => "Tuesday",
            Weekday::Wed => "Wednesday",
            Weekday::Thu => "Thursday",
            Weekday::Fri => "Friday",
            Weekday::Sat => "Saturday",
            Weekday::Sun => "Sunday",
        }
    }

    fn ordinal_suffix(n: u32) -> &'static str {
        match (n % 10, n % 100) {
            (_, 11..=13) => "th",
            (1, _) => "st",
            (2, _) => "nd",
            (3, _) => "rd",
            _ => "th",
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn rule(text: &str) -> RecurrenceRule {
            text.parse().expect("rule parses")
        }

        #[test]
        fn parses_and_renders_canonical_text() {
            assert_eq!(rule("every day").to_string(), "every day");
            assert_eq!(rule("Every 3 Days").to_string(), "every 3 days");
            assert_eq!(rule("every 1 week").to_string(), "every week");
            assert_eq!(
                rule("every 2 weeks on friday and mon").to_string(),
                "every 2 weeks on Monday, Friday"
            );
            assert_eq!(rule("every month on the 1").to_string(), "every month on the 1st");
            assert_eq!(rule("every month on the 22nd").to_string(), "every month on the 22nd");
            assert_eq!(rule("every month on the last").to_string(), "every month on the last");
            assert_eq!(rule("every 2 years").to_string(), "every 2 years");
        }

        #[test]
        fn rejects_unknown_text() {
            for text in ["every", "every 0 days", "each week", "every fortnight", "every week on funday", "every month on the 32nd"] {
                let err = text.parse::<RecurrenceRule>().unwrap_err();
                assert!(
                    matches!(err, TaskError::InvalidRecurrence { .. }),
                    "{text} should be rejected"
                );
            }
        }

        #[test]
        fn daily_and_weekly_advance_by_interval() {
            assert_eq!(rule("every day").next_after(date(2022, 1, 31)), Some(date(2022, 2, 1)));
            assert_eq!(rule("every 3 days").next_after(date(2022, 1, 30)), Some(date(2022, 2, 2)));
            assert_eq!(rule("every week").next_after(date(2021, 4, 9)), Some(date(2021, 4, 16)));
            assert_eq!(rule("every 2 weeks").next_after(date(2021, 4, 9)), Some(date(2021, 4, 23)));
        }

        #[test]
        fn weekly_with_weekdays_respects_week_interval() {
            // 2022-03-02 is a Wednesday.
            let wed = date(2022, 3, 2);
            assert_eq!(rule("every week on friday").next_after(wed), Some(date(2022, 3, 4)));
            assert_eq!(rule("every week on monday").next_after(wed), Some(date(2022, 3, 7)));
            assert_eq!(
                rule("every 2 weeks on monday").next_after(wed),
                Some(date(2022, 3, 14))
            );
            assert_eq!(
                rule("every 2 weeks on monday, thursday").next_after(wed),
                Some(date(2022, 3, 3))
            );
            assert_eq!(rule("every week on wednesday").next_after(wed), Some(date(2022, 3, 9)));
        }

        #[test]
        fn monthly_skips_months_without_the_day() {
            assert_eq!(rule("every month").next_after(date(2022, 1, 15)), Some(date(2022, 2, 15)));
            assert_eq!(rule("every month").next_after(date(2022, 1, 31)), Some(date(2022, 3, 31)));
            assert_eq!(rule("every 3 months").next_after(date(2022, 11, 30)), Some(date(2023, 5, 30)));
        }

        #[test]
        fn monthly_anchored_days() {
            assert_eq!(
                rule("every month on the 20th").next_after(date(2022, 1, 15)),
                Some(date(2022, 1, 20))
            );
            assert_eq!(
                rule("every month on the 10th").next_after(date(2022, 1, 15)),
                Some(date(2022, 2, 10))
            );
            assert_eq!(
                rule("every month on the last").next_after(date(2022, 1, 31)),
                Some(date(2022, 2, 28))
            );
            assert_eq!(
                rule("every month on the last").next_after(date(2024, 2, 10)),
                Some(date(2024, 2, 29))
            );
        }

        #[test]
        fn yearly_waits_for_leap_day() {
            assert_eq!(rule("every year").next_after(date(2021, 6, 1)), Some(date(2022, 6, 1)));
            assert_eq!(rule("every year").next_after(date(2024, 2, 29)), Some(date(2028, 2, 29)));
        }

        #[test]
        fn overflow_yields_none() {
            assert_eq!(rule("every day").next_after(NaiveDate::MAX), None);
            assert_eq!(rule("every week on monday").next_after(NaiveDate::MAX), None);
        }

        #[test]
        fn huge_monthly_intervals_yield_none() {
            let reference = date(2021, 1, 15);
            assert_eq!(rule("every 1431655766 months").next_after(reference), None);
            assert_eq!(rule("every 2147483648 months").next_after(reference), None);
            assert_eq!(
                rule("every 4294967295 months on the 10th").next_after(reference),
                None
            );
            assert_eq!(
                rule("every 4294967295 months on the last").next_after(reference),
                None
            );
        }

        #[test]
        fn huge_weekly_intervals_jump_straight_to_the_target_week() {
            let friday = date(2021, 1, 15);
            assert_eq!(rule("every 4294967295 weeks on monday").next_after(friday), None);
            assert_eq!(
                rule("every 4294967295 weeks on saturday").next_after(friday),
                Some(date(2021, 1, 16))
            );
            assert_eq!(
                rule("every 1000 weeks on monday").next_after(friday),
                date(2021, 1, 11).checked_add_days(Days::new(7000))
            );
        }
    }
}

pub mod parser {
    //! Line grammar for checklist tasks, built on `nom`.
    //!
    //! A line is classified as one of:
    //! - `Task`: `<indent><-|*> [c] <body>` that passes the global filter. The body is
    //!   scanned from the end for annotations (`^block-id`, `✅ date`, `📅 date`, `🔁 rule`).
    //! - `Checklist`: same shape but not a task (global filter absent). Can still be toggled.
    //! - `Malformed`: task-shaped but containing a line break, so it cannot be written back.
    //! - `NotATask`: anything else.
    //!
    //! Annotations are only removed when they parse; anything else stays in the
    //! description, so no text is lost.

    use crate::core::*;
    use crate::recurrence::RecurrenceRule;
    use crate::settings::TaskSettings;
    use chrono::NaiveDate;
    use nom::{
        IResult,
        bytes::complete::take_while,
        character::complete::{anychar, char, one_of},
        combinator::{all_consuming, map_res, opt},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, preceded, tuple},
    };
    use tracing::warn;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const DONE_GLYPHS: &[&str] = &["✅"];
    const DUE_GLYPHS: &[&str] = &["📅", "📆", "🗓"];
    const RECURRENCE_GLYPH: &str = "🔁";
    const VARIATION_SELECTOR: char = '\u{FE0F}';

    /* ------------------------ Public entry points ------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ParsedLine {
        Task(Box<Task>),
        Checklist(ChecklistItem),
        Malformed { reason: &'static str },
        NotATask,
    }

    /// Classify and decompose a single line.
    pub fn parse_line(line: &str, context: &LineContext, settings: &TaskSettings) -> ParsedLine {
        let Ok((_, shape)) = checklist_shape(line) else {
            return ParsedLine::NotATask;
        };
        if line.contains(['\n', '\r']) {
            return ParsedLine::Malformed {
                reason: "line contains a line break",
            };
        }
        if !settings.matches_global_filter(line) {
            return ParsedLine::Checklist(ChecklistItem::from_shape(line, &shape));
        }

        let body = split_annotations(shape.body);
        let task = Task {
            status: Status::from_marker(shape.status),
            original_status_character: shape.status,
            description: body.description,
            path: context.path.clone(),
            indentation: shape.indentation.to_string(),
            list_marker: shape.marker,
            due_date: body.due_date,
            done_date: body.done_date,
            recurrence_rule: body.recurrence_rule,
            block_link: body.block_link,
            section_start: context.section_start,
            section_index: context.section_index,
            preceding_header: context.preceding_header.clone(),
            source_line: Some(line.to_string()),
        };
        ParsedLine::Task(Box::new(task))
    }

    /// `Some(task)` when the line is a task, `None` otherwise.
    pub fn parse_task(line: &str, context: &LineContext, settings: &TaskSettings) -> Option<Task> {
        match parse_line(line, context, settings) {
            ParsedLine::Task(task) => Some(*task),
            _ => None,
        }
    }

    /// A task for the edit dialog, built from any line.
    ///
    /// Task lines parse normally. Other lines are read with a permissive shape
    /// (`[-*]? *([c])? *text`) so a task can be created from plain text or a checklist
    /// item. Lines that cannot be decomposed log a warning and yield an empty task.
    pub fn task_for_editing(line: &str, context: &LineContext, settings: &TaskSettings) -> Task {
        match parse_line(line, context, settings) {
            ParsedLine::Task(task) => *task,
            ParsedLine::Malformed { reason } => {
                warn!(%reason, ?line, "cannot create task on line; using an empty task");
                Task::placeholder(&context.path)
            }
            ParsedLine::Checklist(_) | ParsedLine::NotATask => match permissive_shape(line) {
                Ok((_, shape)) => {
                    let status_char = shape.status.unwrap_or(' ');
                    Task {
                        status: Status::from_marker(status_char),
                        original_status_character: status_char,
                        indentation: shape.indentation.to_string(),
                        list_marker: shape.marker.unwrap_or('-'),
                        ..Task::new(shape.rest.trim_end(), &LineContext::for_path(&context.path))
                    }
                }
                Err(err) => {
                    warn!(?line, error = ?err, "cannot create task on line; using an empty task");
                    Task::placeholder(&context.path)
                }
            },
        }
    }

    /* ----------------------------- Checklist ----------------------------- */

    /// A checklist line that is not a task. Only its status character can change.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ChecklistItem {
        /// Everything up to and including `[`.
        before: String,
        status: char,
        /// Everything from `]` to the end of the line.
        after: String,
    }

    impl ChecklistItem {
        fn from_shape(line: &str, shape: &Shape<'_>) -> Self {
            Self {
                before: line[..shape.status_at].to_string(),
                status: shape.status,
                after: line[shape.status_at + shape.status.len_utf8()..].to_string(),
            }
        }

        pub fn status_character(&self) -> char {
            self.status
        }

        /// The line with `' '` flipped to `'x'`, or any other marker flipped to `' '`.
        pub fn toggled_line(&self) -> String {
            let next = if self.status == ' ' { 'x' } else { ' ' };
            let mut out = String::with_capacity(self.before.len() + self.after.len() + 1);
            out.push_str(&self.before);
            out.push(next);
            out.push_str(&self.after);
            out
        }
    }

    /* ------------------------------ Shapes ------------------------------ */

    struct Shape<'a> {
        indentation: &'a str,
        marker: char,
        status: char,
        /// Byte offset of the status character within the line.
        status_at: usize,
        body: &'a str,
    }

    fn is_indent(c: char) -> bool {
        c.is_whitespace()
    }

    fn checklist_shape(line: &str) -> PResult<'_, Shape<'_>> {
        let (i, indentation) = take_while(is_indent)(line)?;
        let (i, marker) = one_of("-*")(i)?;
        let (i, gap) = take_while(|c: char| c == ' ')(i)?;
        if gap.is_empty() {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("marker-space"))],
            }));
        }
        let (i, _) = char('[')(i)?;
        let status_at = line.len() - i.len();
        let (i, status) = anychar(i)?;
        let (i, _) = char(']')(i)?;
        let (body, _) = take_while(|c: char| c == ' ')(i)?;
        Ok((
            "",
            Shape {
                indentation,
                marker,
                status,
                status_at,
                body,
            },
        ))
    }

    struct PermissiveShape<'a> {
        indentation: &'a str,
        marker: Option<char>,
        status: Option<char>,
        rest: &'a str,
    }

    fn permissive_shape(line: &str) -> PResult<'_, PermissiveShape<'_>> {
        let (i, indentation) = take_while(is_indent)(line)?;
        let (i, marker) = opt(one_of("-*"))(i)?;
        let (i, _) = take_while(|c: char| c == ' ')(i)?;
        let (i, status) = opt(delimited(char('['), anychar, char(']')))(i)?;
        let (rest, _) = take_while(|c: char| c == ' ')(i)?;
        if rest.contains(['\n', '\r']) {
            return Err(nom::Err::Failure(VerboseError {
                errors: vec![(rest, VerboseErrorKind::Context("line-break"))],
            }));
        }
        Ok((
            "",
            PermissiveShape {
                indentation,
                marker,
                status,
                rest,
            },
        ))
    }

    /* ---------------------------- Annotations ---------------------------- */

    #[derive(Debug, Default)]
    struct Body {
        description: String,
        due_date: Option<NaiveDate>,
        done_date: Option<NaiveDate>,
        recurrence_rule: Option<RecurrenceRule>,
        block_link: Option<String>,
    }

    fn split_annotations(body: &str) -> Body {
        let mut out = Body::default();
        let mut rest = body.trim_end();

        if let Some((head, id)) = strip_block_link(rest) {
            out.block_link = Some(id.to_string());
            rest = head;
        }

        // Each kind is taken at most once; a repeat stays in the description.
        loop {
            let text = rest.trim_end();
            if out.done_date.is_none() {
                if let Some((head, date)) = strip_dated(text, DONE_GLYPHS) {
                    out.done_date = Some(date);
                    rest = head;
                    continue;
                }
            }
            if out.due_date.is_none() {
                if let Some((head, date)) = strip_dated(text, DUE_GLYPHS) {
                    out.due_date = Some(date);
                    rest = head;
                    continue;
                }
            }
            if out.recurrence_rule.is_none() {
                if let Some((head, rule)) = strip_recurrence(text) {
                    out.recurrence_rule = Some(rule);
                    rest = head;
                    continue;
                }
            }
            break;
        }

        out.description = rest.trim_end().to_string();
        out
    }

    fn strip_block_link(text: &str) -> Option<(&str, &str)> {
        let pos = text.rfind(" ^")?;
        let id = &text[pos + 2..];
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        valid.then(|| (text[..pos].trim_end(), id))
    }

    fn strip_dated<'a>(text: &'a str, glyphs: &[&str]) -> Option<(&'a str, NaiveDate)> {
        for glyph in glyphs {
            let Some(pos) = text.rfind(glyph) else {
                continue;
            };
            let tail = &text[pos + glyph.len()..];
            let parsed = all_consuming(preceded(
                tuple((opt(char(VARIATION_SELECTOR)), opt(char(' ')))),
                parse_date,
            ))(tail);
            if let Ok((_, date)) = parsed {
                return Some((&text[..pos], date));
            }
        }
        None
    }

    fn strip_recurrence(text: &str) -> Option<(&str, RecurrenceRule)> {
        let pos = text.rfind(RECURRENCE_GLYPH)?;
        let tail = &text[pos + RECURRENCE_GLYPH.len()..];
        let rule_text = tail.strip_prefix(VARIATION_SELECTOR).unwrap_or(tail);
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, ',' | ' ' | '!');
        if rule_text.trim().is_empty() || !rule_text.chars().all(allowed) {
            return None;
        }
        let rule = rule_text.parse::<RecurrenceRule>().ok()?;
        Some((&text[..pos], rule))
    }

    /* ------------------------------- Dates ------------------------------- */

    pub(crate) fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| s.parse::<i32>()),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| s.parse::<u32>()),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| s.parse::<u32>()),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (i, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((i, out))
            }
        }
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::recurrence::Frequency;

        fn ctx() -> LineContext {
            LineContext {
                path: "notes/today.md".into(),
                section_start: 3,
                section_index: 1,
                preceding_header: Some("Errands".into()),
            }
        }

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn task(line: &str) -> Task {
            parse_task(line, &ctx(), &TaskSettings::default()).expect("line is a task")
        }

        #[test]
        fn decomposes_all_annotations() {
            let t = task("  - [ ] Water plants 🔁 every week 📅 2021-04-09 ✅ 2021-04-08 ^abc-1");
            assert_eq!(t.indentation, "  ");
            assert_eq!(t.list_marker, '-');
            assert_eq!(t.status, Status::Todo);
            assert_eq!(t.description, "Water plants");
            assert_eq!(t.due_date, Some(date(2021, 4, 9)));
            assert_eq!(t.done_date, Some(date(2021, 4, 8)));
            assert_eq!(t.block_link.as_deref(), Some("abc-1"));
            let rule = t.recurrence_rule.as_ref().expect("rule");
            assert_eq!(rule.frequency(), Frequency::Weekly);
            assert_eq!(t.path, "notes/today.md");
            assert_eq!(t.section_start, 3);
            assert_eq!(t.section_index, 1);
            assert_eq!(t.preceding_header.as_deref(), Some("Errands"));
        }

        #[test]
        fn annotations_in_any_order_and_glyph_variants() {
            let t = task("* [x] Pay rent 📆2022-02-01 🔁 every month");
            assert_eq!(t.list_marker, '*');
            assert_eq!(t.status, Status::Done);
            assert_eq!(t.description, "Pay rent");
            assert_eq!(t.due_date, Some(date(2022, 2, 1)));
            assert!(t.is_recurring());

            let t = task("- [ ] Review 🗓\u{FE0F} 2022-02-03");
            assert_eq!(t.due_date, Some(date(2022, 2, 3)));
            assert_eq!(t.description, "Review");
        }

        #[test]
        fn unparseable_annotations_stay_in_description() {
            let t = task("- [ ] Odd 📅 2021-02-30");
            assert_eq!(t.due_date, None);
            assert_eq!(t.description, "Odd 📅 2021-02-30");

            let t = task("- [ ] Chore 🔁 every blue moon");
            assert!(t.recurrence_rule.is_none());
            assert_eq!(t.description, "Chore 🔁 every blue moon");

            let t = task("- [ ] Twice 📅 2021-01-01 📅 2021-01-02");
            assert_eq!(t.due_date, Some(date(2021, 1, 2)));
            assert_eq!(t.description, "Twice 📅 2021-01-01");
        }

        #[test]
        fn normalizes_status_but_keeps_the_raw_character() {
            for (line, status, raw) in [
                ("- [ ] a", Status::Todo, ' '),
                ("- [x] a", Status::Done, 'x'),
                ("- [X] a", Status::Done, 'X'),
                ("- [/] a", Status::Done, '/'),
            ] {
                let t = task(line);
                assert_eq!(t.status, status, "{line}");
                assert_eq!(t.original_status_character, raw, "{line}");
            }
            assert_eq!(task("- [/] a").marker(), StatusMarker::Other('/'));
        }

        #[test]
        fn rejects_lines_without_checklist_shape() {
            let settings = TaskSettings::default();
            for line in ["", "plain text", "- item", "-[ ] tight", "- [] empty", "- [ab] two", "1. [ ] numbered"] {
                assert_eq!(parse_line(line, &ctx(), &settings), ParsedLine::NotATask, "{line:?}");
            }
        }

        #[test]
        fn line_breaks_are_malformed() {
            let parsed = parse_line("- [ ] one\ntwo", &ctx(), &TaskSettings::default());
            assert!(matches!(parsed, ParsedLine::Malformed { .. }));
        }

        #[test]
        fn global_filter_demotes_to_checklist() {
            let settings = TaskSettings::with_global_filter("#task");
            assert!(matches!(
                parse_line("- [ ] plain item", &ctx(), &settings),
                ParsedLine::Checklist(_)
            ));
            let t = parse_task("- [ ] #task real item", &ctx(), &settings).expect("task");
            assert_eq!(t.description, "#task real item");
        }

        #[test]
        fn checklist_toggle_rewrites_only_the_marker() {
            let settings = TaskSettings::with_global_filter("#task");
            let ParsedLine::Checklist(item) = parse_line("\t* [ ]   plain item ", &ctx(), &settings)
            else {
                panic!("expected checklist");
            };
            assert_eq!(item.toggled_line(), "\t* [x]   plain item ");

            let ParsedLine::Checklist(item) = parse_line("- [/] half", &ctx(), &settings) else {
                panic!("expected checklist");
            };
            assert_eq!(item.status_character(), '/');
            assert_eq!(item.toggled_line(), "- [ ] half");
        }

        #[test]
        fn editing_builds_tasks_from_any_line() {
            let settings = TaskSettings::with_global_filter("#task");
            let ctx = ctx();

            let t = task_for_editing("Buy milk", &ctx, &settings);
            assert_eq!(t.description, "Buy milk");
            assert_eq!(t.status, Status::Todo);
            assert_eq!(t.to_file_line_string(), "- [ ] Buy milk");

            let t = task_for_editing("  * [x] checked 📅 2021-01-01", &ctx, &settings);
            assert_eq!(t.indentation, "  ");
            assert_eq!(t.list_marker, '*');
            assert_eq!(t.status, Status::Done);
            assert_eq!(t.due_date, None);
            assert_eq!(t.description, "checked 📅 2021-01-01");
            assert_eq!(t.section_start, 0);
            assert_eq!(t.preceding_header, None);

            let t = task_for_editing("- [ ] broken\nline", &ctx, &settings);
            assert_eq!(t, Task::placeholder("notes/today.md"));
        }

        #[test]
        fn parsed_tasks_round_trip_verbatim() {
            for line in [
                "- [ ] Buy milk",
                "    * [x]   spaced out   ",
                "- [ ] Water plants 🔁 every week 📅 2021-04-09",
                "- [x] Pay rent 📆2022-02-01 ✅ 2022-02-01 🔁 Every Month ^rent",
                "- [/] 📅 2021-02-30 odd",
                "- [ ] ",
            ] {
                assert_eq!(task(line).to_file_line_string(), line);
            }
        }
    }
}

pub mod format {
    //! Serialization of tasks back to line text.

    use crate::core::Task;

    impl Task {
        /// The line to write back into the document.
        pub fn to_file_line_string(&self) -> String {
            format_task_line(self)
        }
    }

    /// Source text when the task is unchanged, canonical rendering otherwise.
    pub fn format_task_line(task: &Task) -> String {
        match &task.source_line {
            Some(source) => source.clone(),
            None => render_task_line(task),
        }
    }

    /// `<indent><marker> [c] <description> 🔁 <rule> 📅 <due> ✅ <done> ^<block>`.
    pub fn render_task_line(task: &Task) -> String {
        let mut out = String::new();
        out.push_str(&task.indentation);
        out.push(task.list_marker);
        out.push_str(" [");
        out.push(task.original_status_character);
        out.push_str("] ");
        out.push_str(&render_body(task));
        out
    }

    /// Description followed by its annotations, in the order the parser accepts them.
    pub fn render_body(task: &Task) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !task.description.is_empty() {
            parts.push(task.description.clone());
        }
        if let Some(rule) = &task.recurrence_rule {
            parts.push(format!("🔁 {rule}"));
        }
        if let Some(due) = task.due_date {
            parts.push(format!("📅 {}", due.format("%Y-%m-%d")));
        }
        if let Some(done) = task.done_date {
            parts.push(format!("✅ {}", done.format("%Y-%m-%d")));
        }
        if let Some(link) = &task.block_link {
            parts.push(format!("^{link}"));
        }
        parts.join(" ")
    }

}

pub mod toggle {
    //! The completion state machine.
    //!
    //! Todo → Done stamps the done date and, for recurring tasks with a due date, adds
    //! a fresh Todo for the next occurrence. Done → Todo clears the done date and never
    //! spawns anything. Recurrence always advances from the stored due date, not from
    //! the completion date, so late completions keep the cadence.

    use crate::core::{Status, Task};
    use chrono::NaiveDate;
    use tracing::debug;

    impl Task {
        /// One or two tasks replacing `self`; the completed task comes first.
        pub fn toggle(&self, today: NaiveDate) -> Vec<Task> {
            match self.status {
                Status::Todo => {
                    let completed = Task {
                        status: Status::Done,
                        original_status_character: Status::Done.canonical_marker(),
                        done_date: Some(today),
                        source_line: None,
                        ..self.clone()
                    };
                    match self.next_occurrence() {
                        Some(next) => vec![completed, next],
                        None => vec![completed],
                    }
                }
                Status::Done => vec![Task {
                    status: Status::Todo,
                    original_status_character: Status::Todo.canonical_marker(),
                    done_date: None,
                    source_line: None,
                    ..self.clone()
                }],
            }
        }

        fn next_occurrence(&self) -> Option<Task> {
            let rule = self.recurrence_rule.as_ref()?;
            let Some(due) = self.due_date else {
                debug!(description = %self.description, "recurring task has no due date; no next occurrence");
                return None;
            };
            let Some(next_due) = rule.next_after(due) else {
                debug!(%rule, %due, "recurrence produced no next date");
                return None;
            };
            Some(Task {
                status: Status::Todo,
                original_status_character: Status::Todo.canonical_marker(),
                due_date: Some(next_due),
                done_date: None,
                // Block ids must stay unique within a document.
                block_link: None,
                source_line: None,
                ..self.clone()
            })
        }
    }

}

pub mod commands {
    //! Editor-facing actions. The host supplies the line (or document) and writes back
    //! whatever these return.

    use crate::core::{LineContext, Task};
    use crate::parser::{ParsedLine, parse_line};
    use crate::settings::TaskSettings;
    use chrono::NaiveDate;
    use tracing::warn;

    /// Replacement text for a toggled line, or `None` when the line is not a checklist item.
    pub fn toggle_line(
        line: &str,
        context: &LineContext,
        settings: &TaskSettings,
        today: NaiveDate,
    ) -> Option<String> {
        match parse_line(line, context, settings) {
            ParsedLine::Task(task) => Some(apply_edit(&task.toggle(today))),
            ParsedLine::Checklist(item) => Some(item.toggled_line()),
            ParsedLine::Malformed { reason } => {
                warn!(%reason, ?line, "refusing to toggle malformed line");
                None
            }
            ParsedLine::NotATask => None,
        }
    }

    /// Lines for a finalized task list (e.g. the edit dialog's result), newline-joined.
    pub fn apply_edit(tasks: &[Task]) -> String {
        tasks
            .iter()
            .map(Task::to_file_line_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Replace line `line_number` (0-based) of `document` with `replacement`, which may
    /// span several lines. Line endings of the document are kept.
    pub fn replace_line(document: &str, line_number: usize, replacement: &str) -> Option<String> {
        let mut lines: Vec<String> = document.split('\n').map(str::to_string).collect();
        let target = lines.get_mut(line_number)?;
        *target = if target.ends_with('\r') {
            let mut crlf = replacement.replace('\n', "\r\n");
            crlf.push('\r');
            crlf
        } else {
            replacement.to_string()
        };
        Some(lines.join("\n"))
    }

    /// Line `line_number` of `document`, without its line ending.
    pub fn line_at(document: &str, line_number: usize) -> Option<&str> {
        let line = document.split('\n').nth(line_number)?;
        Some(line.strip_suffix('\r').unwrap_or(line))
    }

    /// Toggle the item on `line_number` and return the updated document.
    pub fn toggle_document_line(
        document: &str,
        line_number: usize,
        context: &LineContext,
        settings: &TaskSettings,
        today: NaiveDate,
    ) -> Option<String> {
        let line = line_at(document, line_number)?;
        let replacement = toggle_line(line, context, settings, today)?;
        replace_line(document, line_number, &replacement)
    }

}

pub mod document {
    //! Extract tasks from a whole markdown document, filling in each task's section
    //! location. Headings open sections; fenced code blocks are skipped.

    use crate::core::{LineContext, Task};
    use crate::parser::parse_task;
    use crate::settings::TaskSettings;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::take_while_m_n,
        character::complete::space1,
        combinator::{eof, rest},
        error::VerboseError,
        sequence::tuple,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub fn tasks_in_document(path: &str, text: &str, settings: &TaskSettings) -> Vec<Task> {
        let mut out = Vec::new();
        let mut context = LineContext::for_path(path);
        let mut fence: Option<char> = None;

        for (number, line) in text.lines().enumerate() {
            if let Some(marker) = fence_marker(line) {
                match fence {
                    Some(open) if open == marker => fence = None,
                    Some(_) => {}
                    None => fence = Some(marker),
                }
                continue;
            }
            if fence.is_some() {
                continue;
            }
            if let Some(title) = heading_text(line) {
                context.preceding_header = Some(title.to_string());
                context.section_start = number;
                context.section_index = 0;
                continue;
            }
            if let Some(task) = parse_task(line, &context, settings) {
                out.push(task);
                context.section_index += 1;
            }
        }
        out
    }

    fn fence_marker(line: &str) -> Option<char> {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            Some('`')
        } else if trimmed.starts_with("~~~") {
            Some('~')
        } else {
            None
        }
    }

    fn heading_text(line: &str) -> Option<&str> {
        let parsed: PResult<'_, _> =
            tuple((take_while_m_n(1, 6, |c: char| c == '#'), alt((space1, eof)), rest))(line);
        let (_, (_, _, title)) = parsed.ok()?;
        Some(title.trim().trim_end_matches('#').trim_end())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn assigns_sections_and_skips_fences() {
            let text = "\
- [ ] before any heading
# Home
- [ ] sweep
some prose
- [x] dust
## Garden #
```
- [ ] not a task, in code
```
* [ ] weed
####### too deep
- [ ] still garden
";
            let tasks = tasks_in_document("house.md", text, &TaskSettings::default());
            let summary: Vec<(&str, usize, usize, Option<&str>)> = tasks
                .iter()
                .map(|t| {
                    (
                        t.description.as_str(),
                        t.section_start,
                        t.section_index,
                        t.preceding_header.as_deref(),
                    )
                })
                .collect();
            assert_eq!(
                summary,
                vec![
                    ("before any heading", 0, 0, None),
                    ("sweep", 1, 0, Some("Home")),
                    ("dust", 1, 1, Some("Home")),
                    ("weed", 5, 0, Some("Garden")),
                    ("still garden", 5, 1, Some("Garden")),
                ]
            );
            assert!(tasks.iter().all(|t| t.path == "house.md"));
        }

        #[test]
        fn respects_global_filter() {
            let text = "- [ ] #task counted\n- [ ] ignored\n";
            let tasks = tasks_in_document("a.md", text, &TaskSettings::with_global_filter("#task"));
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].description, "#task counted");
        }
    }
}

pub mod results {
    //! Grouped query results.
    //!
    //! `TaskGroups` keeps groups in first-seen order. `QueryResult` pairs the groups with
    //! the match count before limiting, or carries an error message and nothing else.

    use crate::core::Task;
    use indexmap::IndexMap;
    use serde::{Serialize, Serializer};

    /// Group names from outermost to innermost; empty when the query does not group.
    pub type GroupKey = Vec<String>;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TaskGroup {
        pub names: GroupKey,
        tasks: Vec<Task>,
    }

    impl TaskGroup {
        pub fn new(names: GroupKey) -> Self {
            Self {
                names,
                tasks: vec![],
            }
        }

        pub fn tasks(&self) -> &[Task] {
            &self.tasks
        }

        pub fn len(&self) -> usize {
            self.tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.tasks.is_empty()
        }

        /// Display heading, e.g. `notes > Errands`.
        pub fn heading(&self) -> String {
            self.names.join(" > ")
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TaskGroups {
        groups: IndexMap<GroupKey, TaskGroup>,
    }

    impl TaskGroups {
        pub fn new() -> Self {
            Self::default()
        }

        /// All tasks under the empty key; no groups at all when there are no tasks.
        pub fn ungrouped(tasks: impl IntoIterator<Item = Task>) -> Self {
            Self::from_keyed(tasks.into_iter().map(|t| (GroupKey::new(), t)))
        }

        pub fn from_keyed(entries: impl IntoIterator<Item = (GroupKey, Task)>) -> Self {
            let mut groups = Self::new();
            for (key, task) in entries {
                groups.add(key, task);
            }
            groups
        }

        /// Append `task` to the group for `key`, creating the group at the end if new.
        pub fn add(&mut self, key: GroupKey, task: Task) {
            self.groups
                .entry(key)
                .or_insert_with_key(|k| TaskGroup::new(k.clone()))
                .tasks
                .push(task);
        }

        pub fn groups(&self) -> impl Iterator<Item = &TaskGroup> {
            self.groups.values()
        }

        pub fn group(&self, key: &[String]) -> Option<&TaskGroup> {
            self.groups.get(key)
        }

        /// Number of groups.
        pub fn len(&self) -> usize {
            self.groups.len()
        }

        pub fn is_empty(&self) -> bool {
            self.groups.is_empty()
        }

        pub fn total_tasks_count(&self) -> usize {
            self.groups.values().map(TaskGroup::len).sum()
        }
    }

    impl Serialize for TaskGroups {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.collect_seq(self.groups.values())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct QueryResult {
        task_groups: TaskGroups,
        total_tasks_count_before_limit: usize,
        search_error_message: Option<String>,
    }

    impl QueryResult {
        /// A successful result. `total_tasks_count_before_limit` is raised to the number of
        /// grouped tasks if the caller passes less.
        pub fn new(task_groups: TaskGroups, total_tasks_count_before_limit: usize) -> Self {
            let total_tasks_count_before_limit =
                total_tasks_count_before_limit.max(task_groups.total_tasks_count());
            Self {
                task_groups,
                total_tasks_count_before_limit,
                search_error_message: None,
            }
        }

        /// A failed search: no groups, zero count, and `message`.
        pub fn from_error(message: impl Into<String>) -> Self {
            Self {
                task_groups: TaskGroups::new(),
                total_tasks_count_before_limit: 0,
                search_error_message: Some(message.into()),
            }
        }

        pub fn task_groups(&self) -> &TaskGroups {
            &self.task_groups
        }

        pub fn groups(&self) -> impl Iterator<Item = &TaskGroup> {
            self.task_groups.groups()
        }

        pub fn total_tasks_count(&self) -> usize {
            self.task_groups.total_tasks_count()
        }

        pub fn total_tasks_count_before_limit(&self) -> usize {
            self.total_tasks_count_before_limit
        }

        pub fn search_error_message(&self) -> Option<&str> {
            self.search_error_message.as_deref()
        }

        pub fn is_error(&self) -> bool {
            self.search_error_message.is_some()
        }

        /// `3 tasks`, `1 task`, or `2 of 5 tasks` when a limit cut the result.
        pub fn total_tasks_count_display_text(&self) -> String {
            let count = self.total_tasks_count();
            let before_limit = self.total_tasks_count_before_limit;
            if count == before_limit {
                format!("{count} {}", pluralise(count))
            } else {
                format!("{count} of {before_limit} {}", pluralise(before_limit))
            }
        }
    }

    fn pluralise(count: usize) -> &'static str {
        if count == 1 { "task" } else { "tasks" }
    }

}

pub mod query {
    //! Query language over parsed tasks.
    //!
    //! One instruction per line; blank lines and `#` comments are ignored. Instructions
    //! are matched case-insensitively:
    //!
    //! ```text
    //! done | not done
    //! (due|done) (before|after|on) <YYYY-MM-DD|today|tomorrow|yesterday>
    //! (has|no) (due|done) date
    //! is recurring | is not recurring
    //! (description|path|heading) (includes|does not include) <text>
    //! sort by (due|done|status|description|path) [reverse]
    //! group by (path|folder|filename|heading|status|due)
    //! limit [to] <n> [tasks]
    //! ```
    //!
    //! Evaluation filters, counts the matches, sorts stably, applies the limit, then groups.

    use crate::core::{Status, Task, TaskError};
    use crate::parser::parse_date;
    use crate::results::{GroupKey, QueryResult, TaskGroups};
    use chrono::{Days, NaiveDate};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::tag,
        character::complete::space1,
        combinator::{all_consuming, eof, map, opt, rest, value},
        error::VerboseError,
        sequence::{preceded, terminated, tuple},
    };
    use std::{cmp::Ordering, path::Path, str::FromStr};
    use tracing::debug;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateField {
        Due,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateComparison {
        Before,
        After,
        On,
    }

    /// A date operand, resolved against the evaluation date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateSpec {
        Absolute(NaiveDate),
        Today,
        Tomorrow,
        Yesterday,
    }

    impl DateSpec {
        fn resolve(self, today: NaiveDate) -> Option<NaiveDate> {
            match self {
                DateSpec::Absolute(d) => Some(d),
                DateSpec::Today => Some(today),
                DateSpec::Tomorrow => today.checked_add_days(Days::new(1)),
                DateSpec::Yesterday => today.checked_sub_days(Days::new(1)),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TextField {
        Description,
        Path,
        Heading,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Filter {
        Done,
        NotDone,
        Date {
            field: DateField,
            comparison: DateComparison,
            date: DateSpec,
        },
        HasDate(DateField),
        NoDate(DateField),
        Recurring(bool),
        Text {
            field: TextField,
            /// Lowercase.
            needle: String,
            include: bool,
        },
    }

    impl Filter {
        pub fn matches(&self, task: &Task, today: NaiveDate) -> bool {
            match self {
                Filter::Done => task.status == Status::Done,
                Filter::NotDone => task.status == Status::Todo,
                Filter::Date {
                    field,
                    comparison,
                    date,
                } => {
                    let (Some(value), Some(target)) = (date_of(task, *field), date.resolve(today))
                    else {
                        return false;
                    };
                    match comparison {
                        DateComparison::Before => value < target,
                        DateComparison::After => value > target,
                        DateComparison::On => value == target,
                    }
                }
                Filter::HasDate(field) => date_of(task, *field).is_some(),
                Filter::NoDate(field) => date_of(task, *field).is_none(),
                Filter::Recurring(wanted) => task.is_recurring() == *wanted,
                Filter::Text {
                    field,
                    needle,
                    include,
                } => {
                    let found = match field {
                        TextField::Description => task.description.to_lowercase().contains(needle),
                        TextField::Path => task.path.to_lowercase().contains(needle),
                        TextField::Heading => task
                            .preceding_header
                            .as_ref()
                            .is_some_and(|h| h.to_lowercase().contains(needle)),
                    };
                    found == *include
                }
            }
        }
    }

    fn date_of(task: &Task, field: DateField) -> Option<NaiveDate> {
        match field {
            DateField::Due => task.due_date,
            DateField::Done => task.done_date,
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SortKey {
        Due,
        Done,
        Status,
        Description,
        Path,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sorting {
        pub key: SortKey,
        pub reverse: bool,
    }

    impl Sorting {
        fn compare(&self, a: &Task, b: &Task) -> Ordering {
            let ord = match self.key {
                SortKey::Due => compare_dates(a.due_date, b.due_date),
                SortKey::Done => compare_dates(a.done_date, b.done_date),
                SortKey::Status => a.status.cmp(&b.status),
                SortKey::Description => a
                    .description
                    .to_lowercase()
                    .cmp(&b.description.to_lowercase()),
                SortKey::Path => a.path.cmp(&b.path),
            };
            if self.reverse { ord.reverse() } else { ord }
        }
    }

    /// Undated tasks sort after dated ones.
    fn compare_dates(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
        match (a, b) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Grouper {
        Path,
        Folder,
        Filename,
        Heading,
        Status,
        Due,
    }

    impl Grouper {
        pub fn group_name(&self, task: &Task) -> String {
            match self {
                Grouper::Path => task
                    .path
                    .strip_suffix(".md")
                    .unwrap_or(&task.path)
                    .to_string(),
                Grouper::Folder => match task.path.rfind('/') {
                    Some(pos) => task.path[..=pos].to_string(),
                    None => "/".to_string(),
                },
                Grouper::Filename => Path::new(&task.path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                Grouper::Heading => task
                    .preceding_header
                    .clone()
                    .unwrap_or_else(|| "(No heading)".to_string()),
                Grouper::Status => task.status.label().to_string(),
                Grouper::Due => match task.due_date {
                    Some(d) => d.format("%Y-%m-%d %A").to_string(),
                    None => "No due date".to_string(),
                },
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Query {
        pub filters: Vec<Filter>,
        pub sorting: Vec<Sorting>,
        pub groupers: Vec<Grouper>,
        pub limit: Option<usize>,
    }

    impl Query {
        pub fn parse(text: &str) -> Result<Self, TaskError> {
            let mut query = Query::default();
            for raw in text.lines() {
                let line = raw.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let lowered = line.to_lowercase();
                let instruction = match all_consuming(instruction)(lowered.as_str()) {
                    Ok((_, instruction)) => instruction,
                    Err(_) => return Err(TaskError::UnknownInstruction(line.to_string())),
                };
                match instruction {
                    Instruction::Filter(filter) => query.filters.push(filter),
                    Instruction::DateFilter {
                        field,
                        comparison,
                        date,
                    } => query.filters.push(Filter::Date {
                        field,
                        comparison,
                        date: parse_date_spec(date)?,
                    }),
                    Instruction::Sort(sorting) => query.sorting.push(sorting),
                    Instruction::Group(grouper) => query.groupers.push(grouper),
                    Instruction::Limit(count) => {
                        let limit = count
                            .parse::<usize>()
                            .map_err(|_| TaskError::InvalidLimit(count.to_string()))?;
                        query.limit = Some(limit);
                    }
                }
            }
            Ok(query)
        }

        pub fn evaluate(&self, tasks: &[Task], today: NaiveDate) -> QueryResult {
            let mut matching: Vec<&Task> = tasks
                .iter()
                .filter(|t| self.filters.iter().all(|f| f.matches(t, today)))
                .collect();
            let before_limit = matching.len();

            if !self.sorting.is_empty() {
                matching.sort_by(|a, b| {
                    self.sorting
                        .iter()
                        .map(|s| s.compare(a, b))
                        .find(|o| o.is_ne())
                        .unwrap_or(Ordering::Equal)
                });
            }
            if let Some(limit) = self.limit {
                matching.truncate(limit);
            }
            debug!(
                matched = before_limit,
                returned = matching.len(),
                "evaluated query"
            );

            let groups = TaskGroups::from_keyed(
                matching
                    .into_iter()
                    .map(|task| (self.group_key(task), task.clone())),
            );
            QueryResult::new(groups, before_limit)
        }

        fn group_key(&self, task: &Task) -> GroupKey {
            self.groupers.iter().map(|g| g.group_name(task)).collect()
        }
    }

    impl FromStr for Query {
        type Err = TaskError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Query::parse(s)
        }
    }

    impl QueryResult {
        /// Parse and run `text`; parse failures become an error result.
        pub fn from_query_text(text: &str, tasks: &[Task], today: NaiveDate) -> QueryResult {
            match Query::parse(text) {
                Ok(query) => query.evaluate(tasks, today),
                Err(err) => QueryResult::from_error(err.to_string()),
            }
        }
    }

    fn parse_date_spec(text: &str) -> Result<DateSpec, TaskError> {
        let text = text.trim();
        match text {
            "today" => Ok(DateSpec::Today),
            "tomorrow" => Ok(DateSpec::Tomorrow),
            "yesterday" => Ok(DateSpec::Yesterday),
            _ => match all_consuming(parse_date)(text) {
                Ok((_, date)) => Ok(DateSpec::Absolute(date)),
                Err(_) => Err(TaskError::InvalidDate(text.to_string())),
            },
        }
    }

    /* ---------------------------- Instructions ---------------------------- */

    enum Instruction<'a> {
        Filter(Filter),
        DateFilter {
            field: DateField,
            comparison: DateComparison,
            date: &'a str,
        },
        Sort(Sorting),
        Group(Grouper),
        Limit(&'a str),
    }

    fn instruction(i: &str) -> PResult<'_, Instruction<'_>> {
        alt((
            map(terminated(status_filter, eof), Instruction::Filter),
            date_filter,
            map(terminated(presence_filter, eof), Instruction::Filter),
            map(terminated(recurring_filter, eof), Instruction::Filter),
            map(text_filter, Instruction::Filter),
            map(terminated(sort_by, eof), Instruction::Sort),
            map(terminated(group_by, eof), Instruction::Group),
            limit,
        ))(i)
    }

    fn status_filter(i: &str) -> PResult<'_, Filter> {
        alt((
            value(Filter::NotDone, tag("not done")),
            value(Filter::Done, tag("done")),
        ))(i)
    }

    fn date_field(i: &str) -> PResult<'_, DateField> {
        alt((
            value(DateField::Due, tag("due")),
            value(DateField::Done, tag("done")),
        ))(i)
    }

    fn date_filter(i: &str) -> PResult<'_, Instruction<'_>> {
        map(
            tuple((
                date_field,
                space1,
                alt((
                    value(DateComparison::Before, tag("before")),
                    value(DateComparison::After, tag("after")),
                    value(DateComparison::On, tag("on")),
                )),
                space1,
                rest,
            )),
            |(field, _, comparison, _, date)| Instruction::DateFilter {
                field,
                comparison,
                date,
            },
        )(i)
    }

    fn presence_filter(i: &str) -> PResult<'_, Filter> {
        alt((
            map(
                tuple((tag("has"), space1, date_field, space1, tag("date"))),
                |(_, _, field, _, _)| Filter::HasDate(field),
            ),
            map(
                tuple((tag("no"), space1, date_field, space1, tag("date"))),
                |(_, _, field, _, _)| Filter::NoDate(field),
            ),
        ))(i)
    }

    fn recurring_filter(i: &str) -> PResult<'_, Filter> {
        alt((
            value(Filter::Recurring(false), tag("is not recurring")),
            value(Filter::Recurring(true), tag("is recurring")),
        ))(i)
    }

    fn text_filter(i: &str) -> PResult<'_, Filter> {
        map(
            tuple((
                alt((
                    value(TextField::Description, tag("description")),
                    value(TextField::Path, tag("path")),
                    value(TextField::Heading, tag("heading")),
                )),
                space1,
                alt((
                    value(true, tag("includes")),
                    value(false, tag("does not include")),
                )),
                space1,
                rest,
            )),
            |(field, _, include, _, needle): (TextField, &str, bool, &str, &str)| Filter::Text {
                field,
                needle: needle.trim().to_string(),
                include,
            },
        )(i)
    }

    fn sort_by(i: &str) -> PResult<'_, Sorting> {
        map(
            tuple((
                tag("sort by"),
                space1,
                alt((
                    value(SortKey::Due, tag("due")),
                    value(SortKey::Done, tag("done")),
                    value(SortKey::Status, tag("status")),
                    value(SortKey::Description, tag("description")),
                    value(SortKey::Path, tag("path")),
                )),
                opt(preceded(space1, tag("reverse"))),
            )),
            |(_, _, key, reverse)| Sorting {
                key,
                reverse: reverse.is_some(),
            },
        )(i)
    }

    fn group_by(i: &str) -> PResult<'_, Grouper> {
        preceded(
            tuple((tag("group by"), space1)),
            alt((
                value(Grouper::Path, tag("path")),
                value(Grouper::Folder, tag("folder")),
                value(Grouper::Filename, tag("filename")),
                value(Grouper::Heading, tag("heading")),
                value(Grouper::Status, tag("status")),
                value(Grouper::Due, tag("due")),
            )),
        )(i)
    }

    fn limit(i: &str) -> PResult<'_, Instruction<'_>> {
        let (i, _) = tag("limit")(i)?;
        let (i, _) = space1(i)?;
        let (i, _) = opt(tuple((tag("to"), space1)))(i)?;
        let (i, count) = rest(i)?;
        let count = count.trim_end();
        let count = count
            .strip_suffix("tasks")
            .or_else(|| count.strip_suffix("task"))
            .map(str::trim_end)
            .unwrap_or(count);
        Ok((i, Instruction::Limit(count)))
    }

}

pub use commands::{apply_edit, replace_line, toggle_document_line, toggle_line};
pub use core::{LineContext, Status, StatusMarker, Task, TaskError};
pub use document::tasks_in_document;
pub use parser::{ChecklistItem, ParsedLine, parse_line, parse_task, task_for_editing};
pub use query::Query;
pub use recurrence::RecurrenceRule;
pub use results::{GroupKey, QueryResult, TaskGroup, TaskGroups};
pub use settings::TaskSettings;
