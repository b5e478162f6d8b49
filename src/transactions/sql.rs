//! SQL 归一化
//!
//! 把字面量替换成占位符，便于按语句模式聚合指标

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("string literal pattern"));
static NUMERIC_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("numeric literal pattern"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// 语句类型（由第一个关键字推断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Other,
}

impl SqlType {
    /// 从 SQL 文本推断语句类型
    pub fn infer(sql: &str) -> Self {
        let keyword: String = sql
            .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();

        match keyword.to_ascii_uppercase().as_str() {
            "SELECT" => SqlType::Select,
            "INSERT" => SqlType::Insert,
            "UPDATE" => SqlType::Update,
            "DELETE" => SqlType::Delete,
            "CREATE" => SqlType::Create,
            "DROP" => SqlType::Drop,
            "ALTER" => SqlType::Alter,
            _ => SqlType::Other,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Select => "SELECT",
            SqlType::Insert => "INSERT",
            SqlType::Update => "UPDATE",
            SqlType::Delete => "DELETE",
            SqlType::Create => "CREATE",
            SqlType::Drop => "DROP",
            SqlType::Alter => "ALTER",
            SqlType::Other => "OTHER",
        };
        write!(f, "{}", name)
    }
}

/// 归一化 SQL：字符串和数字常量替换为 `?`，空白折叠为单个空格
pub fn normalize_sql(sql: &str) -> String {
    // 先替换字符串，避免字符串内的数字被单独替换
    let without_strings = STRING_LITERAL.replace_all(sql, "?");
    let without_numbers = NUMERIC_LITERAL.replace_all(&without_strings, "?");
    WHITESPACE.replace_all(&without_numbers, " ").trim().to_string()
}
