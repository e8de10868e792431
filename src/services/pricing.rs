//! 价格计算服务 - 业务能力层
//!
//! 按模型和时段（标准 / 优惠）计算 token 费用，并预估一段未来时间内的费用。
//!
//! 时段只由一天中的时刻决定，与日期、记录、密钥无关；所有查询都是
//! (模型, 时间) 的纯函数。预估费用时把时间段切成若干"只落在一个时段内"
//! 的子区间分别计价后求和，跨越时段边界的长批次不会被按单一价格估算。

use crate::error::{AppResult, ConfigError};
use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

/// 计价时段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TariffPeriod {
    Standard,
    Discount,
}

/// 单一时段的价格（货币/百万 tokens）
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceRate {
    /// 输入（缓存命中）
    #[serde(alias = "input_cache_hit")]
    pub cache_hit: f64,
    /// 输入（缓存未命中）
    #[serde(alias = "input_cache_miss")]
    pub cache_miss: f64,
    /// 输出
    pub output: f64,
}

impl PriceRate {
    pub const ZERO: PriceRate = PriceRate {
        cache_hit: 0.0,
        cache_miss: 0.0,
        output: 0.0,
    };

    pub fn new(cache_hit: f64, cache_miss: f64, output: f64) -> Self {
        Self {
            cache_hit,
            cache_miss,
            output,
        }
    }
}

/// 一个模型在两个时段的价格
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub standard: PriceRate,
    pub discount: PriceRate,
}

impl ModelPricing {
    pub fn rate(&self, period: TariffPeriod) -> PriceRate {
        match period {
            TariffPeriod::Standard => self.standard,
            TariffPeriod::Discount => self.discount,
        }
    }
}

/// 优惠时段（首尾均包含），允许跨越午夜（如 22:00-06:00）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscountWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl Default for DiscountWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(0, 30, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(8, 30, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl DiscountWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// 解析 "HH:MM" 或 "HH:MM:SS"
    pub fn parse(start: &str, end: &str) -> AppResult<Self> {
        Ok(Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?))
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }

    pub fn period_at(&self, t: NaiveTime) -> TariffPeriod {
        if self.contains(t) {
            TariffPeriod::Discount
        } else {
            TariffPeriod::Standard
        }
    }

    /// `t` 之后第一次切换时段的时刻
    ///
    /// 优惠时段的结束时刻本身仍属于优惠时段，所以切出时刻落在它之后 1ns。
    fn next_switch(&self, t: NaiveDateTime, period: TariffPeriod) -> NaiveDateTime {
        match period {
            TariffPeriod::Standard => next_occurrence(t, self.start, false),
            TariffPeriod::Discount => {
                next_occurrence(t, self.end, true) + Duration::nanoseconds(1)
            }
        }
    }
}

fn parse_time_of_day(value: &str) -> AppResult<NaiveTime> {
    let trimmed = value.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| {
            ConfigError::InvalidTimeOfDay {
                value: value.to_string(),
            }
            .into()
        })
}

/// `tod` 在 `t` 之后（`inclusive` 时含 `t` 本身）的第一次出现
fn next_occurrence(t: NaiveDateTime, tod: NaiveTime, inclusive: bool) -> NaiveDateTime {
    let candidate = t.date().and_time(tod);
    if candidate > t || (inclusive && candidate == t) {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

fn seconds_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from)
        .num_nanoseconds()
        .map(|n| n as f64 / 1e9)
        .unwrap_or(f64::MAX)
}

/// 参与计价的 token 数量（预估时可以是小数）
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TokenVolume {
    pub prompt: f64,
    pub completion: f64,
    pub cache_hit: f64,
    pub cache_miss: f64,
}

impl TokenVolume {
    /// 把一段 token 总量按比例拆成输入/输出、命中/未命中
    pub fn split(tokens: f64, prompt_ratio: f64, cache_miss_ratio: f64) -> Self {
        let prompt_ratio = prompt_ratio.clamp(0.0, 1.0);
        let cache_miss_ratio = cache_miss_ratio.clamp(0.0, 1.0);
        let prompt = tokens * prompt_ratio;
        Self {
            prompt,
            completion: tokens * (1.0 - prompt_ratio),
            cache_hit: prompt * (1.0 - cache_miss_ratio),
            cache_miss: prompt * cache_miss_ratio,
        }
    }
}

/// 只落在一个时段内的时间片
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TariffSegment {
    pub seconds: f64,
    pub period: TariffPeriod,
}

/// 价格表：模型 × 时段
#[derive(Clone, Debug)]
pub struct PriceTable {
    models: HashMap<String, ModelPricing>,
    default_model: String,
    window: DiscountWindow,
    currency: String,
}

impl PriceTable {
    pub fn new(
        models: HashMap<String, ModelPricing>,
        default_model: impl Into<String>,
        window: DiscountWindow,
    ) -> Self {
        Self {
            models,
            default_model: default_model.into(),
            window,
            currency: "¥".to_string(),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn tariff_period(&self, at: NaiveDateTime) -> TariffPeriod {
        self.window.period_at(at.time())
    }

    /// 查找价格；未知模型使用默认模型的价格
    pub fn rate(&self, model: &str, period: TariffPeriod) -> PriceRate {
        if let Some(pricing) = self.models.get(model) {
            return pricing.rate(period);
        }
        match self.models.get(&self.default_model) {
            Some(pricing) => pricing.rate(period),
            None => {
                warn!("⚠️ 价格表中没有模型 {} 或默认模型 {}", model, self.default_model);
                PriceRate::ZERO
            }
        }
    }

    /// 某一时刻的费用
    ///
    /// 命中和未命中都为 0 但输入 token 大于 0 时，全部按未命中计价。
    pub fn instant_cost(&self, volume: TokenVolume, model: &str, at: NaiveDateTime) -> f64 {
        self.cost_in_period(volume, model, self.tariff_period(at))
    }

    fn cost_in_period(&self, volume: TokenVolume, model: &str, period: TariffPeriod) -> f64 {
        let rate = self.rate(model, period);
        let (hit, miss) = if volume.cache_hit == 0.0 && volume.cache_miss == 0.0 {
            (0.0, volume.prompt)
        } else {
            (volume.cache_hit, volume.cache_miss)
        };
        hit / TOKENS_PER_UNIT * rate.cache_hit
            + miss / TOKENS_PER_UNIT * rate.cache_miss
            + volume.completion / TOKENS_PER_UNIT * rate.output
    }

    /// 把 `[start, start + seconds)` 切成只落在一个时段内的最大子区间
    pub fn segments(&self, start: NaiveDateTime, seconds: f64) -> Vec<TariffSegment> {
        let mut segments = Vec::new();
        if !seconds.is_finite() || seconds <= 0.0 {
            return segments;
        }

        let mut current = start;
        let mut remaining = seconds;
        while remaining > 0.0 {
            let period = self.tariff_period(current);
            let switch_at = self.window.next_switch(current, period);
            let span = remaining.min(seconds_between(current, switch_at));
            segments.push(TariffSegment {
                seconds: span,
                period,
            });
            remaining -= span;
            current = switch_at;
        }
        segments
    }

    /// 预估从 `start` 起 `remaining_seconds` 秒内的费用（逐时段计价）
    pub fn projected_cost(
        &self,
        remaining_seconds: f64,
        tokens_per_second: f64,
        prompt_ratio: f64,
        cache_miss_ratio: f64,
        model: &str,
        start: NaiveDateTime,
    ) -> f64 {
        self.segments(start, remaining_seconds)
            .iter()
            .map(|segment| {
                let tokens = segment.seconds * tokens_per_second;
                let volume = TokenVolume::split(tokens, prompt_ratio, cache_miss_ratio);
                self.cost_in_period(volume, model, segment.period)
            })
            .sum()
    }

    /// 格式化价格显示
    pub fn format_price(&self, price: f64) -> String {
        if price < 0.01 {
            format!("{}{:.4}", self.currency, price)
        } else if price < 1.0 {
            format!("{}{:.3}", self.currency, price)
        } else {
            format!("{}{:.2}", self.currency, price)
        }
    }
}
