//! 分页控制器
//!
//! 把顺序页号 + 固定页大小换算为 (offset, limit) 窗口。
//! 窗口单调递增请求，已拉取的窗口不会再次请求。

use serde::{Deserialize, Serialize};

/// 一个有界的偏移窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageWindow {
    /// 从 0 开始的页序号
    pub index: u64,
    pub offset: u64,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationController {
    page_size: u32,
    next_index: u64,
}

impl PaginationController {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            next_index: 0,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// 返回下一个窗口并前进
    pub fn request_next_window(&mut self) -> PageWindow {
        let window = self.peek_next_window();
        self.next_index += 1;
        window
    }

    /// 查看下一个窗口但不前进
    pub fn peek_next_window(&self) -> PageWindow {
        PageWindow {
            index: self.next_index,
            offset: self.next_index * self.page_size as u64,
            limit: self.page_size,
        }
    }

    /// 回退一个窗口（该窗口请求失败，需要原样重试时使用）
    pub fn rewind(&mut self) {
        self.next_index = self.next_index.saturating_sub(1);
    }

    /// 过滤或排序变化后重置
    pub fn reset(&mut self) {
        self.next_index = 0;
    }

    pub fn has_more(fetched_count: u64, filtered_total: u64) -> bool {
        fetched_count < filtered_total
    }
}
