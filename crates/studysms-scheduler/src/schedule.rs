//! Schedule engine. Maps (study date, today) to the stage due today.
//!
//! The table is keyed purely by elapsed days. There is no history lookup and
//! no catch-up: if nobody runs dispatch on the day an offset is due, that
//! stage is skipped for good.

use chrono::NaiveDate;
use studysms_core::Stage;

const FIRST_NAME: &str = "{first_name}";

/// One row of the contact schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Days from the study date (negative = before).
    pub offset: i64,
    pub stage: Stage,
    /// Message body; `{first_name}` is substituted on render.
    pub template: &'static str,
}

/// The fixed contact schedule, in firing order.
pub const SCHEDULE: [ScheduleEntry; 12] = [
    ScheduleEntry {
        offset: -3,
        stage: Stage::IntroText,
        template: "Hi {first_name}!\n\n\
You have been selected to participate in the Narratives Project! If you are still interested in participating, please read the email we sent you. It might be in your spam folder.\n\n\
If you have any questions, call or text us at (650)-223-5997 and we will get back to you as soon as possible.",
    },
    ScheduleEntry {
        offset: 0,
        stage: Stage::Rem1,
        template: "Hello!\n\n\
This is your reminder that if you would like to participate in the Narratives Project, please click the link we sent to your email and begin the study. Please complete Visits 1 and 2 by Sunday at 11:59pm.\n\n\
If you have any questions call or text us at (650) 223-5997 and we will get back to you ASAP.",
    },
    ScheduleEntry {
        offset: 2,
        stage: Stage::Rem2,
        template: "Hello!\n\n\
This is your reminder that today is the last day to complete Visits 1 and 2 of the Narratives Project. Please click the link we sent to your email and begin (or log back in to finish).",
    },
    ScheduleEntry {
        offset: 6,
        stage: Stage::Rem3,
        template: "Hello!\n\n\
This is your reminder to log back into the website and complete Visit 3 of the Narratives Project. We emailed you the link to log back into the website. Please complete Visit 3 on the day that is 1 week after you completed Visit 2. If you forgot when you completed Visit 2, you can log in to the website and it tells you what day to log back in for Visit 3.\n\n\
And remember: if you complete all 5 visits you will be entered into a raffle to receive an extra $250 giftcard!",
    },
    ScheduleEntry {
        offset: 9,
        stage: Stage::Rem4,
        template: "Hello!\n\n\
This is your reminder to log back into the website and complete Visit 3 of the Narratives Project if you have not already done so. We emailed you the link to log back into the website.\n\n\
And remember: if you complete all 5 visits you will be entered into a raffle to receive an extra $250 giftcard!",
    },
    ScheduleEntry {
        offset: 11,
        stage: Stage::Pay1,
        template: "Hello and thank you for participating in part or all of Visits 1-3.\n\n\
We emailed you your giftcard. Visit 4 will happen in a few weeks - we will email and text you to remind you to complete it.\n\n\
And remember: if you complete all 5 visits you will be entered into a raffle to receive an extra $250 giftcard! Thanks again!",
    },
    ScheduleEntry {
        offset: 29,
        stage: Stage::Rem5,
        template: "Hello!\n\n\
This is your reminder to complete Visit 4 of the Narratives Project. Please complete it on the day that is 1 month after you completed Visit 2. If you forgot when you completed Visit 2, you can log in to the website and it tells you what day to log back in for Visit 4.\n\n\
And remember: if you complete all 5 visits you will be entered into a raffle to receive an extra $250 giftcard!",
    },
    ScheduleEntry {
        offset: 32,
        stage: Stage::Rem6,
        template: "Hello!\n\n\
This is your reminder to log back into the website and complete Visit 4 of the Narratives Project if you have not already done so. We emailed you the link to log back into the website.\n\n\
And remember: if you complete all 5 visits you will be entered into a raffle to receive an extra $250 giftcard!",
    },
    ScheduleEntry {
        offset: 34,
        stage: Stage::Pay2,
        template: "Hello and thank you for participating in part or all of Visit 4.\n\n\
We emailed you your giftcard. Visit 5 will happen in a few months - we will email and text you to remind you to complete it.\n\n\
And remember: if you complete all 5 visits you will be entered into a raffle to receive an extra $250 giftcard!",
    },
    ScheduleEntry {
        offset: 89,
        stage: Stage::Rem7,
        template: "Hello!\n\n\
This is your reminder to complete Visit 5 of the Narratives Project. Please complete it on the day that is 3 months after you completed Visit 2. If you forgot when you completed Visit 2, you can log in to the website and it tells you what day to log back in for Visit 5.\n\n\
And remember: if you complete all 5 visits you will be entered into a raffle to receive an extra $250 giftcard!",
    },
    ScheduleEntry {
        offset: 92,
        stage: Stage::Rem8,
        template: "Hello!\n\n\
This is your reminder to log back into the website and complete Visit 5 of the Narratives Project if you have not already done so. We emailed you the link to log back into the website.\n\n\
And remember: if you complete all 5 visits you will be entered into a raffle to receive an extra $250 giftcard!",
    },
    ScheduleEntry {
        offset: 94,
        stage: Stage::Pay3,
        template: "Hello and thank you for participating in part or all of Visit 5. We emailed you your giftcard. Thanks again for participating in the Narratives Project!",
    },
];

/// The stage due today and its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub stage: Stage,
    pub template: &'static str,
}

impl Decision {
    /// Message body addressed to `first_name`.
    pub fn render(&self, first_name: &str) -> String {
        self.template.replace(FIRST_NAME, first_name)
    }
}

/// Whole days from `study_date` to `today`.
pub fn offset_days(study_date: NaiveDate, today: NaiveDate) -> i64 {
    (today - study_date).num_days()
}

/// Stage due on `today` for a participant whose study date is `study_date`,
/// or `None` when the offset is not in the table.
pub fn decide(study_date: NaiveDate, today: NaiveDate) -> Option<Decision> {
    let offset = offset_days(study_date, today);
    SCHEDULE
        .iter()
        .find(|entry| entry.offset == offset)
        .map(|entry| Decision {
            stage: entry.stage,
            template: entry.template,
        })
}

/// Schedule row for a stage.
pub fn entry_for(stage: Stage) -> &'static ScheduleEntry {
    // Every stage has exactly one row; see test_every_stage_scheduled_once.
    SCHEDULE
        .iter()
        .find(|entry| entry.stage == stage)
        .unwrap_or(&SCHEDULE[0])
}

/// Calendar date on which `stage` is due for `study_date`.
pub fn due_date(study_date: NaiveDate, stage: Stage) -> NaiveDate {
    study_date + chrono::Duration::days(entry_for(stage).offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        studysms_core::types::parse_date(s).unwrap()
    }

    #[test]
    fn test_intro_three_days_before() {
        let decision = decide(date("06/01/2022"), date("05/29/2022")).unwrap();
        assert_eq!(decision.stage, Stage::IntroText);
        let body = decision.render("Ian");
        assert!(body.starts_with("Hi Ian!"));
        assert!(!body.contains(FIRST_NAME));
    }

    #[test]
    fn test_rem1_on_study_day() {
        let decision = decide(date("06/01/2022"), date("06/01/2022")).unwrap();
        assert_eq!(decision.stage, Stage::Rem1);
        assert!(decision.render("Ian").contains("Visits 1 and 2"));
    }

    #[test]
    fn test_no_action_off_table() {
        assert_eq!(decide(date("06/01/2022"), date("06/05/2022")), None);
    }

    #[test]
    fn test_table_offsets() {
        let study = date("06/01/2022");
        let cases = [
            (-3, Stage::IntroText),
            (0, Stage::Rem1),
            (2, Stage::Rem2),
            (6, Stage::Rem3),
            (9, Stage::Rem4),
            (11, Stage::Pay1),
            (29, Stage::Rem5),
            (32, Stage::Rem6),
            (34, Stage::Pay2),
            (89, Stage::Rem7),
            (92, Stage::Rem8),
            (94, Stage::Pay3),
        ];
        for (offset, stage) in cases {
            let today = study + chrono::Duration::days(offset);
            assert_eq!(decide(study, today).map(|d| d.stage), Some(stage), "offset {offset}");
            assert_eq!(due_date(study, stage), today);
        }
    }

    #[test]
    fn test_none_everywhere_else() {
        let study = date("06/01/2022");
        let scheduled: Vec<i64> = SCHEDULE.iter().map(|e| e.offset).collect();
        for offset in -30..=150 {
            if scheduled.contains(&offset) {
                continue;
            }
            let today = study + chrono::Duration::days(offset);
            assert!(decide(study, today).is_none(), "offset {offset} should not fire");
        }
    }

    #[test]
    fn test_decide_is_deterministic() {
        let study = date("02/27/2024");
        for offset in -5..100 {
            let today = study + chrono::Duration::days(offset);
            assert_eq!(decide(study, today), decide(study, today));
        }
    }

    #[test]
    fn test_offsets_cross_month_and_leap_day() {
        // 2024 is a leap year: 02/27 + 2 days = 02/29.
        let decision = decide(date("02/27/2024"), date("02/29/2024")).unwrap();
        assert_eq!(decision.stage, Stage::Rem2);
        // Intro for a March 1st study lands on Feb 27th.
        let decision = decide(date("03/01/2024"), date("02/27/2024")).unwrap();
        assert_eq!(decision.stage, Stage::IntroText);
    }

    #[test]
    fn test_every_stage_scheduled_once() {
        for stage in Stage::ALL {
            assert_eq!(SCHEDULE.iter().filter(|e| e.stage == stage).count(), 1);
            assert_eq!(entry_for(stage).stage, stage);
        }
        let mut offsets: Vec<i64> = SCHEDULE.iter().map(|e| e.offset).collect();
        let sorted = offsets.clone();
        offsets.sort();
        offsets.dedup();
        assert_eq!(offsets, sorted, "offsets must be unique and in firing order");
        // Firing order agrees with stage ordering.
        assert!(SCHEDULE.windows(2).all(|w| w[0].stage < w[1].stage));
    }

    #[test]
    fn test_only_intro_uses_first_name() {
        for entry in SCHEDULE.iter() {
            let uses_name = entry.template.contains(FIRST_NAME);
            assert_eq!(uses_name, entry.stage == Stage::IntroText, "{}", entry.stage);
        }
    }
}
