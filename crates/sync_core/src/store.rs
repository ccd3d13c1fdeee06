//! Client-held copy of both lanes plus the operator's view settings.
//!
//! Every mutation here is synchronous; callers hold the store lock for the
//! whole of one mutation so no partial update is ever observable.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::{LanePair, RowId, Side},
    protocol::{PendingItem, Row},
};
use tracing::debug;

use crate::{
    error::SyncError,
    normalize::{canonical_timestamp, NormalizedLane},
};

pub const CSV_HEADER: &str =
    "id,wagon_no,train_no,side,container_no_1,iso_code_1,container_no_2,iso_code_2,finalizedAt,time";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneState {
    pub rows: Vec<Row>,
    pub pending: Vec<PendingItem>,
    issued_generation: u64,
    applied_generation: u64,
}

/// Issued when a lane fetch starts; a response is applied only if its ticket is newer
/// than the last one applied for that lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchTicket(u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub side: Side,
    pub id: RowId,
}

/// Operator-controlled view settings. Serializable so a presentation layer can persist it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewState {
    pub search: String,
    pub tentative_only: bool,
    pub page_size: usize,
    pub pages: LanePair<usize>,
    pub selected: Option<Selection>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            search: String::new(),
            tentative_only: false,
            page_size: 10,
            pages: LanePair::default(),
            selected: None,
        }
    }
}

impl ViewState {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..Self::default()
        }
    }

    pub fn set_search(&mut self, search: impl Into<String>) {
        self.search = search.into();
        self.reset_pages();
    }

    pub fn set_tentative_only(&mut self, tentative_only: bool) {
        self.tentative_only = tentative_only;
        self.reset_pages();
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size.max(1);
        self.reset_pages();
    }

    pub fn reset_pages(&mut self) {
        self.pages = LanePair::default();
    }
}

/// Case-insensitive search over the operator-visible fields, then the tentative-only toggle.
pub fn row_matches(row: &Row, search: &str, tentative_only: bool) -> bool {
    if tentative_only && row.is_final() {
        return false;
    }
    let needle = search.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    let side = row.side.map(Side::as_str);
    let haystack = [
        Some(row.id.to_string().as_str()),
        row.wagon_no.as_deref(),
        row.train_no.as_deref(),
        side,
        row.container_no_1.as_deref(),
        row.iso_code_1.as_deref(),
        row.container_no_2.as_deref(),
        row.iso_code_2.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase();
    haystack.contains(&needle)
}

pub fn filter_rows<'a>(rows: &'a [Row], view: &ViewState) -> Vec<&'a Row> {
    rows.iter()
        .filter(|row| row_matches(row, &view.search, view.tentative_only))
        .collect()
}

pub fn page_count(total: usize, page_size: usize) -> usize {
    total.div_ceil(page_size.max(1)).max(1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaneView<'a> {
    pub side: Side,
    pub rows: Vec<&'a Row>,
    pub filtered_total: usize,
    pub page: usize,
    pub page_count: usize,
    pub pending: &'a [PendingItem],
    pub buffer: Option<&'a Value>,
}

/// Filtered rows of one lane, windowed to `[page * size, (page + 1) * size)`.
pub fn derive<'a>(
    side: Side,
    lane: &'a LaneState,
    buffer: Option<&'a Value>,
    view: &ViewState,
) -> LaneView<'a> {
    let filtered = filter_rows(&lane.rows, view);
    let size = view.page_size.max(1);
    let page = *view.pages.get(side);
    let filtered_total = filtered.len();
    let rows = filtered
        .into_iter()
        .skip(page.saturating_mul(size))
        .take(size)
        .collect();
    LaneView {
        side,
        rows,
        filtered_total,
        page,
        page_count: page_count(filtered_total, size),
        pending: &lane.pending,
        buffer,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvExport {
    pub filename: String,
    pub contents: String,
}

#[derive(Debug, Clone, Default)]
pub struct ViewStateStore {
    lanes: LanePair<LaneState>,
    buffer: Option<Value>,
    view: ViewState,
}

impl ViewStateStore {
    pub fn new(view: ViewState) -> Self {
        Self {
            lanes: LanePair::default(),
            buffer: None,
            view,
        }
    }

    pub fn lane(&self, side: Side) -> &LaneState {
        self.lanes.get(side)
    }

    pub fn buffer(&self) -> Option<&Value> {
        self.buffer.as_ref()
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn begin_fetch(&mut self, side: Side) -> FetchTicket {
        let lane = self.lanes.get_mut(side);
        lane.issued_generation += 1;
        FetchTicket(lane.issued_generation)
    }

    /// Replaces the lane wholesale. Returns `false` when a newer fetch already landed.
    pub fn apply_fetch(&mut self, side: Side, ticket: FetchTicket, lane: NormalizedLane) -> bool {
        let state = self.lanes.get_mut(side);
        if ticket.0 <= state.applied_generation {
            debug!(
                %side,
                ticket = ticket.0,
                applied = state.applied_generation,
                "store: discarding superseded lane response"
            );
            return false;
        }
        state.applied_generation = ticket.0;
        state.rows = lane.rows;
        state.pending = lane.pending;
        if lane.buffer.is_some() {
            self.buffer = lane.buffer;
        }
        true
    }

    pub fn derive(&self, side: Side) -> LaneView<'_> {
        derive(side, self.lanes.get(side), self.buffer.as_ref(), &self.view)
    }

    pub fn filtered(&self, side: Side) -> Vec<&Row> {
        filter_rows(&self.lanes.get(side).rows, &self.view)
    }

    pub fn set_search(&mut self, search: impl Into<String>) {
        self.view.set_search(search);
    }

    pub fn set_tentative_only(&mut self, tentative_only: bool) {
        self.view.set_tentative_only(tentative_only);
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.view.set_page_size(page_size);
    }

    /// Moves a lane to `page`, clamped to the last page of the filtered rows.
    pub fn set_page(&mut self, side: Side, page: usize) -> usize {
        let total = self.filtered(side).len();
        let last = page_count(total, self.view.page_size) - 1;
        let page = page.min(last);
        *self.view.pages.get_mut(side) = page;
        page
    }

    pub fn select(&mut self, side: Side, id: RowId) {
        self.view.selected = Some(Selection { side, id });
    }

    pub fn clear_selection(&mut self) {
        self.view.selected = None;
    }

    /// The selected row as of the latest fetch; `None` once it has left its lane.
    pub fn selected_row(&self) -> Option<(Side, &Row)> {
        let selection = self.view.selected.as_ref()?;
        self.lanes
            .get(selection.side)
            .rows
            .iter()
            .find(|row| row.id == selection.id)
            .map(|row| (selection.side, row))
    }

    pub fn export_csv(&self, side: Side) -> Result<Option<CsvExport>, SyncError> {
        self.export_csv_at(side, Utc::now())
    }

    /// CSV of the filtered (not paged) lane; `None` when there is nothing to export.
    pub fn export_csv_at(
        &self,
        side: Side,
        now: DateTime<Utc>,
    ) -> Result<Option<CsvExport>, SyncError> {
        let rows = self.filtered(side);
        if rows.is_empty() {
            return Ok(None);
        }

        let mut buffer = format!("{CSV_HEADER}\n").into_bytes();
        {
            let mut writer = csv::WriterBuilder::new()
                .quote_style(csv::QuoteStyle::Always)
                .terminator(csv::Terminator::Any(b'\n'))
                .from_writer(&mut buffer);
            for row in rows {
                writer.write_record(csv_record(side, row))?;
            }
            writer.flush().map_err(csv::Error::from)?;
        }

        let contents = String::from_utf8(buffer)
            .map_err(|err| SyncError::Export(format!("csv is not utf-8: {err}")))?;
        Ok(Some(CsvExport {
            filename: format!("sequence-{side}-{}.csv", now.format("%Y%m%d-%H%M%S")),
            contents,
        }))
    }
}

fn csv_record(side: Side, row: &Row) -> [String; 10] {
    let text = |value: &Option<String>| value.clone().unwrap_or_default();
    let time = DateTime::from_timestamp_millis(canonical_timestamp(row))
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default();
    [
        row.id.to_string(),
        text(&row.wagon_no),
        text(&row.train_no),
        row.side.unwrap_or(side).to_string(),
        text(&row.container_no_1),
        text(&row.iso_code_1),
        text(&row.container_no_2),
        text(&row.iso_code_2),
        row.finalized_at
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
        time,
    ]
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
