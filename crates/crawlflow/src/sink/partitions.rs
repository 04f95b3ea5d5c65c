//! Names and DDL for the two-level layout: one range partition per day,
//! each list-partitioned by crawl id with a default catch-all.

use chrono::{Duration, NaiveDate};

use crate::crawl_id::{date_tag, CrawlId, MAX_SEQUENCE};

pub fn date_partition(table: &str, date: NaiveDate) -> String {
    format!("{table}-{}", date_tag(date))
}

pub fn list_partition(table: &str, date: NaiveDate, sequence: u8) -> String {
    format!("{table}-{}{sequence:02}", date_tag(date))
}

pub fn default_partition(table: &str, date: NaiveDate) -> String {
    format!("{table}-{}_default", date_tag(date))
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_parent_sql(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {t} (
    natural_key TEXT NOT NULL,
    crawl_date DATE NOT NULL,
    crawl_id BIGINT NOT NULL,
    data JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (natural_key, crawl_date, crawl_id)
) PARTITION BY RANGE (crawl_date)"#,
        t = quote_ident(table)
    )
}

/// Statements creating the partitions of `date`, in dependency order.
///
/// List partitions come before the default one so creating them never has
/// to move rows out of the catch-all.
pub fn date_partition_sql(table: &str, date: NaiveDate, max_list_partition: u8) -> Vec<String> {
    let day = quote_ident(&date_partition(table, date));
    let next = date + Duration::days(1);

    let mut out = Vec::with_capacity(max_list_partition as usize + 2);
    out.push(format!(
        "CREATE TABLE IF NOT EXISTS {day} PARTITION OF {parent} \
         FOR VALUES FROM ('{from}') TO ('{to}') PARTITION BY LIST (crawl_id)",
        parent = quote_ident(table),
        from = date.format("%Y-%m-%d"),
        to = next.format("%Y-%m-%d"),
    ));

    for sequence in 1..=max_list_partition.min(MAX_SEQUENCE) {
        let Ok(id) = CrawlId::new(date, sequence) else {
            continue;
        };
        out.push(format!(
            "CREATE TABLE IF NOT EXISTS {list} PARTITION OF {day} FOR VALUES IN ({id})",
            list = quote_ident(&list_partition(table, date, sequence)),
            id = id.as_i64(),
        ));
    }

    out.push(format!(
        "CREATE TABLE IF NOT EXISTS {default} PARTITION OF {day} DEFAULT",
        default = quote_ident(&default_partition(table, date)),
    ));
    out
}

/// `today` through `today + future_days`.
pub fn date_window(today: NaiveDate, future_days: u32) -> Vec<NaiveDate> {
    (0..=i64::from(future_days))
        .map(|d| today + Duration::days(d))
        .collect()
}

/// Day partitions strictly older than this are dropped.
pub fn retention_cutoff(today: NaiveDate, retention_days: u32) -> NaiveDate {
    today - Duration::days(i64::from(retention_days))
}

/// Date of a day partition named `{table}-{YYYYMMDD}`; `None` for nested or
/// foreign tables.
pub fn parse_date_partition(table: &str, name: &str) -> Option<NaiveDate> {
    let tag = name.strip_prefix(table)?.strip_prefix('-')?;
    if tag.len() != 8 || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(tag, "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn names_follow_the_date_and_suffix_layout() {
        let d = day(2024, 3, 9);
        assert_eq!(date_partition("whales", d), "whales-20240309");
        assert_eq!(list_partition("whales", d, 3), "whales-2024030903");
        assert_eq!(default_partition("whales", d), "whales-20240309_default");
    }

    #[test]
    fn ddl_for_one_day() {
        let sql = date_partition_sql("whales", day(2024, 2, 29), 2);
        assert_eq!(sql.len(), 4);
        assert!(sql[0].contains(r#""whales-20240229" PARTITION OF "whales""#));
        assert!(sql[0].contains("FROM ('2024-02-29') TO ('2024-03-01')"));
        assert!(sql[1].ends_with("FOR VALUES IN (2024022901)"));
        assert!(sql[2].ends_with("FOR VALUES IN (2024022902)"));
        assert!(sql[3].contains(r#""whales-20240229_default""#));
        assert!(sql[3].ends_with("DEFAULT"));
    }

    #[test]
    fn window_includes_today_and_future_days() {
        let w = date_window(day(2024, 12, 31), 2);
        assert_eq!(w, vec![day(2024, 12, 31), day(2025, 1, 1), day(2025, 1, 2)]);
    }

    #[test]
    fn only_day_partitions_parse() {
        assert_eq!(
            parse_date_partition("whales", "whales-20240101"),
            Some(day(2024, 1, 1))
        );
        assert_eq!(parse_date_partition("whales", "whales-2024010101"), None);
        assert_eq!(parse_date_partition("whales", "whales-20240101_default"), None);
        assert_eq!(parse_date_partition("whales", "whales_top-20240101"), None);
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident(r#"a"b"#), r#""a""b""#);
    }
}
