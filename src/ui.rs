//! 與操作者互動的介面。協議引擎只透過這個 trait 顯示指示或詢問參數。

use tracing::info;

use crate::error::{Error, Result};

pub trait UserInterface {
    /// 顯示一則訊息。
    fn message(&self, text: &str) -> Result<()>;

    /// 顯示文字並等待操作者輸入一行。
    fn prompt(&self, text: &str) -> Result<String>;

    fn password_prompt(&self, text: &str) -> Result<String>;

    /// 是/否問題，`default` 為直接按下 enter 時的答案。
    fn yes_no(&self, title: &str, text: &str, default: bool) -> Result<bool>;
}

/// 無人值守模式：訊息寫入日誌，提示直接返回，是非題採用預設值。
#[derive(Debug, Clone, Copy, Default)]
pub struct Unattended;

impl UserInterface for Unattended {
    fn message(&self, text: &str) -> Result<()> {
        info!("{}", text);
        Ok(())
    }

    fn prompt(&self, text: &str) -> Result<String> {
        info!("{}", text);
        Ok(String::new())
    }

    fn password_prompt(&self, _text: &str) -> Result<String> {
        Err(Error::Ui("no password available in unattended mode".into()))
    }

    fn yes_no(&self, _title: &str, text: &str, default: bool) -> Result<bool> {
        info!(answer = default, "{}", text);
        Ok(default)
    }
}
