//! 收件箱页面解析
//!
//! 页面结构随时会变，所以不按固定位置取列，而是按列名匹配：
//! 列名来自表头 `<th>` 文本或单元格的 `data-label` 属性，
//! 归一化（去首尾空白、转小写、压缩空白）后按前缀比对。
//!
//! - 找不到任何带三类列名的表格 → `ParseFailure`（带原始片段）
//! - 表格认得但没有完整的行 → 空列表
//! - 时间无法解析的行跳过

use regex::Regex;
use tracing::{debug, warn};

use crate::config::LabelPrefixes;
use crate::error::{Result, SmsHubError};
use crate::provider::{ProviderKind, RawMessage};
use crate::storage::entities::MessageSource;
use crate::utils::parse_provider_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Sender,
    Body,
    Time,
}

/// 页面解析用到的正则，构造时编译一次
#[derive(Debug, Clone)]
struct Patterns {
    table: Regex,
    row: Regex,
    cell: Regex,
    data_label: Regex,
    tag: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern).map_err(|e| SmsHubError::Config(format!("收件箱解析正则无效: {}", e)))
        };
        Ok(Self {
            table: build(r"(?is)<table\b[^>]*>(.*?)</table\s*>")?,
            row: build(r"(?is)<tr\b[^>]*>(.*?)</tr\s*>")?,
            cell: build(r"(?is)<(td|th)\b([^>]*)>(.*?)</t[dh]\s*>")?,
            data_label: build(r#"(?i)\bdata-label\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
            tag: build(r"(?s)<[^>]*>")?,
        })
    }
}

struct Cell {
    header: bool,
    label: Option<String>,
    text: String,
}

#[derive(Debug, Clone)]
pub struct InboxParser {
    labels: LabelPrefixes,
    patterns: Patterns,
}

impl InboxParser {
    pub fn new(labels: LabelPrefixes) -> Result<Self> {
        let normalize_all = |items: Vec<String>| -> Vec<String> {
            items
                .iter()
                .map(|s| normalize_label(s))
                .filter(|s| !s.is_empty())
                .collect()
        };
        Ok(Self {
            labels: LabelPrefixes {
                sender: normalize_all(labels.sender),
                body: normalize_all(labels.body),
                time: normalize_all(labels.time),
            },
            patterns: Patterns::compile()?,
        })
    }

    pub fn parse(&self, html: &str) -> Result<Vec<RawMessage>> {
        let mut recognised = false;
        let mut messages = Vec::new();

        for table in self.patterns.table.captures_iter(html) {
            let rows: Vec<Vec<Cell>> = self
                .patterns
                .row
                .captures_iter(&table[1])
                .map(|row| self.parse_cells(&row[1]))
                .collect();

            let mut header: Vec<Option<Column>> = Vec::new();
            let mut table_columns: Vec<Column> = Vec::new();

            for cells in &rows {
                if !cells.is_empty() && cells.iter().all(|c| c.header) {
                    header = cells.iter().map(|c| self.column_of(&c.text)).collect();
                    table_columns.extend(header.iter().flatten().copied());
                    continue;
                }

                let mut sender = None;
                let mut body = None;
                let mut time = None;
                for (index, cell) in cells.iter().enumerate() {
                    let column = match &cell.label {
                        Some(label) => self.column_of(label),
                        None => header.get(index).copied().flatten(),
                    };
                    let Some(column) = column else { continue };
                    table_columns.push(column);
                    let slot = match column {
                        Column::Sender => &mut sender,
                        Column::Body => &mut body,
                        Column::Time => &mut time,
                    };
                    if slot.is_none() && !cell.text.is_empty() {
                        *slot = Some(cell.text.as_str());
                    }
                }

                let (Some(sender), Some(body), Some(time)) = (sender, body, time) else {
                    continue;
                };
                match parse_provider_timestamp(time) {
                    Some(received_at) => messages.push(RawMessage {
                        sender: sender.to_string(),
                        body: body.to_string(),
                        received_at,
                        source: MessageSource::Scrape,
                    }),
                    None => debug!("跳过时间无法解析的行: {:?}", time),
                }
            }

            if [Column::Sender, Column::Body, Column::Time]
                .iter()
                .all(|c| table_columns.contains(c))
            {
                recognised = true;
            }
        }

        if !recognised {
            let err = SmsHubError::parse_failure(
                ProviderKind::Inbox,
                "页面里没有带发件人/内容/时间列的表格",
                html,
            );
            warn!("⚠️ {}", err);
            return Err(err);
        }

        Ok(messages)
    }

    fn column_of(&self, raw_label: &str) -> Option<Column> {
        let label = normalize_label(raw_label);
        if label.is_empty() {
            return None;
        }
        let matches = |prefixes: &[String]| prefixes.iter().any(|p| label.starts_with(p.as_str()));
        if matches(&self.labels.sender) {
            Some(Column::Sender)
        } else if matches(&self.labels.body) {
            Some(Column::Body)
        } else if matches(&self.labels.time) {
            Some(Column::Time)
        } else {
            None
        }
    }

    fn parse_cells(&self, row_html: &str) -> Vec<Cell> {
        self.patterns
            .cell
            .captures_iter(row_html)
            .map(|cap| {
                let label = self.patterns.data_label.captures(&cap[2]).and_then(|l| {
                    l.get(1)
                        .or_else(|| l.get(2))
                        .map(|m| decode_entities(m.as_str()))
                });
                Cell {
                    header: cap[1].eq_ignore_ascii_case("th"),
                    label,
                    text: self.cell_text(&cap[3]),
                }
            })
            .collect()
    }

    fn cell_text(&self, inner_html: &str) -> String {
        let stripped = self.patterns.tag.replace_all(inner_html, " ");
        let decoded = decode_entities(&stripped);
        decoded.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 常见 HTML 实体解码（命名实体只处理页面里实际会出现的几种）
pub(crate) fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = tail.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &tail[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some(' '),
                _ => {
                    if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                        u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
                    } else if let Some(dec) = entity.strip_prefix('#') {
                        dec.parse::<u32>().ok().and_then(char::from_u32)
                    } else {
                        None
                    }
                }
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
