use chrono::{DateTime, Local, NaiveDate, Timelike};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Writes transcripts to `<base>/<source...>/<year>/<month>/<day>.txt`.
///
/// Late night conversations stay in the file of the day they started in: a
/// new file is only started once the date changed and either it is 6 AM or
/// later, or nothing was logged for four hours.
pub struct Logger {
    base_dir: PathBuf,
    cur_date: NaiveDate,
    last_log: DateTime<Local>,
    day_passed: bool,
}

/// Keeps a path component inside the log directory.
fn sanitize(component: &str) -> String {
    match component {
        "" | "." | ".." => "_".to_owned(),
        _ => component
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
            .collect(),
    }
}

impl Logger {
    fn gen_path(&self, source: &[&str], date: &NaiveDate) -> io::Result<PathBuf> {
        let year_str = format!("{}", date.format("%Y"));
        let month_str = format!("{}", date.format("%m"));
        let day_str = format!("{}", date.format("%d"));

        let mut path = self.base_dir.clone();
        for component in source {
            path.push(sanitize(component));
        }
        let path = path.join(year_str).join(month_str);
        fs::create_dir_all(&path)?;
        Ok(path.join(format!("{}.txt", day_str)))
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Logger {
        let now = Local::now();
        Logger {
            base_dir: path.as_ref().to_path_buf(),
            cur_date: now.date_naive(),
            last_log: now,
            day_passed: false,
        }
    }

    pub fn log_at<P: AsRef<str>>(
        &mut self,
        now: DateTime<Local>,
        source: &[&str],
        what: P,
    ) -> io::Result<PathBuf> {
        let now_str = now.format("%Y-%m-%d %H:%M:%S");
        let time_diff = now.signed_duration_since(self.last_log);

        if now.date_naive() > self.last_log.date_naive() {
            self.day_passed = true;
        }

        if self.day_passed && (time_diff.num_seconds() > 14400 || now.hour() >= 6) {
            self.cur_date = now.date_naive();
            self.day_passed = false;
        }

        let path = self.gen_path(source, &self.cur_date)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let what = format!("[{}] {}\n", now_str, what.as_ref());
        file.write_all(what.as_bytes())?;
        self.last_log = now;
        Ok(path)
    }

    pub fn log<P: AsRef<str>>(&mut self, source: &[&str], what: P) -> io::Result<PathBuf> {
        self.log_at(Local::now(), source, what)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use std::env;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2021, 3, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn days_roll_over_in_the_morning() {
        let dir = env::temp_dir().join(format!("chatbotd-logger-{}", std::process::id()));
        let mut logger = Logger::new(&dir);
        logger.last_log = at(1, 22, 0);
        logger.cur_date = at(1, 22, 0).date_naive();

        let first = logger.log_at(at(1, 23, 0), &["srv", "#a"], "evening").unwrap();
        let night = logger.log_at(at(2, 1, 0), &["srv", "#a"], "night").unwrap();
        let morning = logger.log_at(at(2, 7, 0), &["srv", "#a"], "morning").unwrap();

        assert_eq!(first, dir.join("srv").join("#a").join("2021").join("03").join("01.txt"));
        assert_eq!(night, first);
        assert_eq!(morning, dir.join("srv").join("#a").join("2021").join("03").join("02.txt"));

        let content = fs::read_to_string(&first).unwrap();
        assert_eq!(
            content,
            "[2021-03-01 23:00:00] evening\n[2021-03-02 01:00:00] night\n"
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn components_cannot_escape() {
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("a/b"), "a_b");
        assert_eq!(sanitize("#rust"), "#rust");
    }
}
