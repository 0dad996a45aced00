use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};
use serde::Serialize;

use crate::series::Timeframe;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankRow {
    pub rank: usize,
    pub ticker: String,
    pub value: f64,
}

/// Ranks by value, largest first. Non-finite values are left out.
pub fn rank_descending(values: impl IntoIterator<Item = (String, f64)>) -> Vec<RankRow> {
    let mut rows: Vec<(String, f64)> = values.into_iter().filter(|(_, v)| v.is_finite()).collect();
    rows.sort_by(|a, b| b.1.total_cmp(&a.1));
    rows.into_iter()
        .enumerate()
        .map(|(i, (ticker, value))| RankRow {
            rank: i + 1,
            ticker,
            value,
        })
        .collect()
}

/// Ranks by value, smallest first. Non-finite values are left out.
pub fn rank_ascending(values: impl IntoIterator<Item = (String, f64)>) -> Vec<RankRow> {
    let mut rows = rank_descending(values);
    rows.reverse();
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i + 1;
    }
    rows
}

/// Volatility z-score rankings for one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolatilityRanking {
    pub timeframe: Timeframe,
    pub most_volatile: Vec<RankRow>,
    pub most_stable: Vec<RankRow>,
}

impl VolatilityRanking {
    /// Tickers without a reading (`None`) are not ranked.
    pub fn from_scores(timeframe: Timeframe, scores: &[(String, Option<f64>)]) -> Self {
        let present = || {
            scores
                .iter()
                .filter_map(|(t, v)| v.map(|v| (t.clone(), v)))
        };
        Self {
            timeframe,
            most_volatile: rank_descending(present()),
            most_stable: rank_ascending(present()),
        }
    }
}

/// Rounded-border table with a bold header; columns from `numeric_from` on are right-aligned.
pub fn table_with_header<'a>(header: impl IntoIterator<Item = &'a str>, numeric_from: usize) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .into_iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
    for column in table.column_iter_mut().skip(numeric_from) {
        column.set_cell_alignment(CellAlignment::Right);
    }
    table
}

/// Titled table of ranked rows.
pub fn format_ranking(title: &str, rows: &[RankRow]) -> String {
    let mut table = table_with_header(["Rank", "Ticker", "Value"], 2);
    for r in rows {
        table.add_row(vec![
            Cell::new(r.rank).fg(Color::DarkGrey),
            Cell::new(&r.ticker).fg(Color::Cyan),
            Cell::new(format!("{:.4}", r.value)),
        ]);
    }
    format!("{title}\n{table}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores() -> Vec<(String, f64)> {
        vec![
            ("XLK".to_string(), 1.2),
            ("XLE".to_string(), 0.9),
            ("XLF".to_string(), f64::NAN),
            ("XLV".to_string(), 1.05),
        ]
    }

    #[test]
    fn test_rank_descending_skips_nan() {
        let ranked = rank_descending(scores());
        let order: Vec<&str> = ranked.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(order, vec!["XLK", "XLV", "XLE"]);
        assert_eq!(ranked[2].rank, 3);
    }

    #[test]
    fn test_volatility_ranking_orders_both_ways() {
        let scores = vec![
            ("XLU".to_string(), Some(-0.5)),
            ("XLK".to_string(), Some(1.5)),
            ("XLRE".to_string(), None),
        ];
        let ranking = VolatilityRanking::from_scores(Timeframe::Weekly, &scores);
        assert_eq!(ranking.most_volatile[0].ticker, "XLK");
        assert_eq!(ranking.most_stable[0].ticker, "XLU");
        assert_eq!(ranking.most_stable[0].rank, 1);
        assert_eq!(ranking.most_stable.len(), 2);
    }

    #[test]
    fn test_format_ranking_lists_every_row_in_rank_order() {
        let text = format_ranking("RS", &rank_descending(scores()));
        assert!(text.starts_with("RS\n"));
        let row_of = |ticker: &str| text.lines().position(|l| l.contains(ticker));
        let (xlk, xlv, xle) = (row_of("XLK"), row_of("XLV"), row_of("XLE"));
        assert!(xlk.is_some() && xlv.is_some() && xle.is_some());
        assert!(xlk < xlv && xlv < xle);
        assert!(row_of("XLF").is_none());
        assert!(text.contains("1.2000"));
    }

    #[test]
    fn test_table_with_header_has_one_column_per_heading() {
        let mut table = table_with_header(["", "XLK", "XLE"], 1);
        assert_eq!(table.column_count(), 3);
        assert!(table.to_string().contains("XLE"));
    }
}
