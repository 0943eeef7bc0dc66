//! Decision engine.
//!
//! Around each of the exchange's auto-loan ticks the engine inspects the
//! held credits and the ask side of the funding book and decides which
//! credits to displace with cheaper book liquidity. Amount bookkeeping
//! is exact; rate-weighted cost comparisons run in double precision.

use bfx_core::{
    Amount, Balance, BorrowTask, Credit, Market, OrderBook, OrderBookEntry, Position, Rate,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Engine parameters, distilled from the process configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Funding currency this instance manages.
    pub currency: String,
    /// Period between the exchange's auto-loan ticks.
    pub auto_loan_fetch_period: Duration,
    /// Offset after a tick at which the activation window begins.
    pub auto_loan_fetch_shift: Duration,
    /// Offset after a tick at which the window ends.
    pub auto_loan_fetch_end_shift: Duration,
    /// Minimum relative rate gap (0..1) to justify refinancing.
    pub min_rate_difference: f64,
    /// Minimum order value in USD below which a task is discarded.
    pub min_order_amount: f64,
    /// Relative top-ask drop that triggers early task firing.
    pub min_rate_diff_in_ask_to_force_borrow: f64,
    /// Watch the realtime book for opportunistic early firing.
    pub realtime: bool,
}

/// The decision engine for one currency.
pub struct Engine {
    config: EngineConfig,
    /// Markets quoted in the currency; long positions there are funded in it.
    quote_curr_markets: HashSet<String>,
    /// Markets based in the currency; short positions there are funded in it.
    base_curr_markets: HashSet<String>,
}

impl Engine {
    pub fn new(config: EngineConfig, markets: &[Market]) -> Self {
        let mut quote_curr_markets = HashSet::new();
        let mut base_curr_markets = HashSet::new();
        for m in markets {
            if m.quote == config.currency {
                quote_curr_markets.insert(m.name.clone());
            }
            if m.base == config.currency {
                base_curr_markets.insert(m.name.clone());
            }
        }
        Self {
            config,
            quote_curr_markets,
            base_curr_markets,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Funding the open positions require in the configured currency.
    ///
    /// Long positions on currency-quoted markets contribute their value
    /// (`amount * base_price`); short positions on currency-based
    /// markets contribute their amount. Held balances reduce the
    /// requirement, never below zero.
    pub fn calculate_total_borrow(
        &self,
        positions: &[Position],
        balances: Option<&[Balance]>,
    ) -> Amount {
        let mut total = Amount::ZERO;
        for p in positions {
            if p.long && self.quote_curr_markets.contains(&p.market) {
                total += p.amount * p.base_price;
            } else if !p.long && self.base_curr_markets.contains(&p.market) {
                total += p.amount;
            }
        }
        if let Some(balances) = balances {
            for b in balances {
                if b.currency == self.config.currency {
                    total = total.saturating_sub(b.total);
                }
            }
        }
        total
    }

    /// The next auto-loan tick strictly after `now` (window anchor):
    /// `truncate(now, period) + shift`, advanced one period if already
    /// passed.
    pub fn next_auto_loan_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_aligned(
            now,
            self.config.auto_loan_fetch_period,
            self.config.auto_loan_fetch_shift,
        )
    }

    /// Split credits into those the exchange will refinance at the next
    /// auto-loan tick and those that keep running.
    pub fn classify_credits<'a>(
        &self,
        credits: &'a [Credit],
        now: DateTime<Utc>,
    ) -> (Vec<&'a Credit>, Vec<&'a Credit>) {
        let next_tick = self.next_auto_loan_time(now);
        let mut normal = Vec::new();
        let mut to_expire = Vec::new();
        for c in credits {
            if c.loan.expires_at() <= next_tick {
                to_expire.push(c);
            } else {
                normal.push(c);
            }
        }
        (normal, to_expire)
    }

    /// Build the borrow task for one activation window.
    ///
    /// `fetched_total_borrow` is the position/balance requirement from
    /// [`calculate_total_borrow`]; `usd_price` converts the task value
    /// for the minimum-order check.
    pub fn make_borrow_task(
        &self,
        book: &OrderBook,
        credits: &[Credit],
        fetched_total_borrow: Amount,
        usd_price: f64,
        now: DateTime<Utc>,
    ) -> BorrowTask {
        let asks = &book.ask;
        if asks.is_empty() {
            debug!("ask book empty, nothing to do");
            return BorrowTask::default();
        }

        let (mut normal, to_expire) = self.classify_credits(credits, now);
        normal.sort_by(|a, b| a.loan.rate.cmp(&b.loan.rate));

        let mut cursor = AskCursor::new(asks);
        let mut task = BorrowTask::default();

        // Running totals of the displacement under construction.
        let mut ask_cost = 0.0f64;
        let mut ask_amount = 0.0f64;
        let mut credit_cost = 0.0f64;
        let mut credit_amount = 0.0f64;

        // Highest-rate credits first: they benefit most from displacement.
        for credit in normal.iter().rev() {
            let want = credit.loan.amount;
            let fill = cursor.fill(want);
            if fill.exhausted {
                // Cannot back this credit fully with asks; a partial
                // close is impossible, so the displacement ends here.
                break;
            }
            let want_f = want.to_f64();
            let rate_f = credit.loan.rate.to_f64();

            // Best obtainable cost for the same amount, from the book
            // bottom: a credit already cheaper than that stays.
            let low_cost = cost_from_bottom(asks, want);
            if want_f * rate_f < low_cost {
                break;
            }

            // Displacing this credit must beat a naive top-down
            // refinance of the most expensive holdings.
            let hcs_cost = top_credit_cost(&normal, want);
            let ob_cost = cursor.peek_cost(want);
            if hcs_cost < ob_cost {
                break;
            }

            ask_cost += fill.cost;
            ask_amount += fill.taken.to_f64();
            credit_cost += want_f * rate_f;
            credit_amount += want_f;

            // Commit only while the book's average rate undercuts the
            // displaced credits by the configured margin.
            let ask_avg = ask_cost / ask_amount;
            let credit_avg = credit_cost / credit_amount;
            if ask_avg < credit_avg * (1.0 - self.config.min_rate_difference) {
                task.loan_ids_to_close.push(credit.loan.id);
                task.total_borrow += want;
            } else {
                break;
            }
        }

        // Credits the exchange will close on its own this cycle: borrow
        // their replacement from the book, without closing anything.
        for credit in &to_expire {
            let fill = cursor.fill(credit.loan.amount);
            task.total_borrow += fill.taken;
            if fill.exhausted {
                break;
            }
        }

        // Exposure not yet covered by any credit.
        let credits_sum: Amount = credits.iter().map(|c| c.loan.amount).sum();
        if fetched_total_borrow > credits_sum {
            let fill = cursor.fill(fetched_total_borrow - credits_sum);
            task.total_borrow += fill.taken;
        }

        task.rate = cursor.last_rate;

        if task.total_borrow.to_f64() * usd_price < self.config.min_order_amount {
            if !task.is_empty() {
                info!(
                    total_borrow = %task.total_borrow,
                    "borrow task below minimum order value, discarded"
                );
            }
            return BorrowTask::default();
        }
        task
    }
}

/// Next `truncate(now, period) + shift`, advanced one period if passed.
pub fn next_aligned(now: DateTime<Utc>, period: Duration, shift: Duration) -> DateTime<Utc> {
    let period_ms = period.as_millis() as i64;
    let shift_ms = shift.as_millis() as i64;
    let now_ms = now.timestamp_millis();
    let mut t = now_ms - now_ms.rem_euclid(period_ms) + shift_ms;
    if t < now_ms {
        t += period_ms;
    }
    now + ChronoDuration::milliseconds(t - now_ms)
}

/// Consuming cursor over the ask book.
///
/// Amounts are consumed exactly; costs accumulate in `f64` as
/// `Σ amount·rate`. The rate of the last consumed level is remembered
/// as the task rate.
struct AskCursor<'a> {
    asks: &'a [OrderBookEntry],
    idx: usize,
    /// Amount already consumed within `asks[idx]`.
    filled: Amount,
    last_rate: Rate,
}

struct Fill {
    taken: Amount,
    cost: f64,
    exhausted: bool,
}

impl<'a> AskCursor<'a> {
    fn new(asks: &'a [OrderBookEntry]) -> Self {
        Self {
            asks,
            idx: 0,
            filled: Amount::ZERO,
            last_rate: Rate::ZERO,
        }
    }

    /// Consume up to `want` from the cursor.
    fn fill(&mut self, want: Amount) -> Fill {
        let mut remaining = want;
        let mut taken = Amount::ZERO;
        let mut cost = 0.0f64;
        while remaining.is_positive() && self.idx < self.asks.len() {
            let level = &self.asks[self.idx];
            let avail = level.amount.saturating_sub(self.filled);
            if avail.is_zero() {
                self.idx += 1;
                self.filled = Amount::ZERO;
                continue;
            }
            let take = avail.min(remaining);
            self.filled += take;
            taken += take;
            remaining = remaining.saturating_sub(take);
            cost += take.to_f64() * level.rate.to_f64();
            self.last_rate = level.rate;
            if self.filled == level.amount {
                self.idx += 1;
                self.filled = Amount::ZERO;
            }
        }
        Fill {
            taken,
            cost,
            exhausted: remaining.is_positive(),
        }
    }

    /// Cost of the next `want` from the cursor, without advancing.
    /// Returns a partial cost if the book runs out.
    fn peek_cost(&self, want: Amount) -> f64 {
        let mut probe = AskCursor {
            asks: self.asks,
            idx: self.idx,
            filled: self.filled,
            last_rate: self.last_rate,
        };
        probe.fill(want).cost
    }
}

/// Cost of the first `want` worth of asks from the bottom of the book,
/// independent of any cursor.
fn cost_from_bottom(asks: &[OrderBookEntry], want: Amount) -> f64 {
    AskCursor::new(asks).fill(want).cost
}

/// Cost of the top `want` worth of held credits, highest rate first.
fn top_credit_cost(sorted_by_rate_asc: &[&Credit], want: Amount) -> f64 {
    let mut remaining = want;
    let mut cost = 0.0f64;
    for credit in sorted_by_rate_asc.iter().rev() {
        if !remaining.is_positive() {
            break;
        }
        let take = credit.loan.amount.min(remaining);
        cost += take.to_f64() * credit.loan.rate.to_f64();
        remaining = remaining.saturating_sub(take);
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfx_core::Loan;
    use chrono::TimeZone;
    use std::time::Duration;

    fn test_engine() -> Engine {
        let config = EngineConfig {
            currency: "UST".into(),
            auto_loan_fetch_period: Duration::from_secs(20 * 60),
            auto_loan_fetch_shift: Duration::from_secs(15 * 60),
            auto_loan_fetch_end_shift: Duration::from_secs(9 * 60 + 20),
            min_rate_difference: 0.2,
            min_order_amount: 150.0,
            min_rate_diff_in_ask_to_force_borrow: 0.2,
            realtime: true,
        };
        let markets = [
            Market::from_symbol("BTCUST").unwrap(),
            Market::from_symbol("ADAUST").unwrap(),
            Market::from_symbol("BTCUSD").unwrap(),
            Market::from_symbol("USTUSD").unwrap(),
        ];
        Engine::new(config, &markets)
    }

    fn position(market: &str, amount: u64, base_price: u64, long: bool) -> Position {
        Position {
            id: 1,
            market: market.into(),
            status: "ACTIVE".into(),
            amount: Amount::from_units(amount),
            long,
            base_price: Amount::from_units(base_price),
            funding: Amount::ZERO,
            liq_price: Amount::ZERO,
        }
    }

    fn balance(currency: &str, total: u64) -> Balance {
        Balance {
            currency: currency.into(),
            wallet: "margin".into(),
            total: Amount::from_units(total),
            available: Amount::from_units(total),
        }
    }

    fn credit(id: u64, amount: u64, rate: u64, create_time: DateTime<Utc>) -> Credit {
        Credit {
            loan: Loan {
                id,
                currency: "UST".into(),
                side: -1,
                create_time,
                update_time: create_time,
                amount: Amount::from_units(amount),
                status: "ACTIVE".into(),
                rate: Rate::from_units(rate),
                period: 2,
                renew: false,
                no_close: false,
            },
            market: "BTCUST".into(),
        }
    }

    fn ask(rate: u64, amount: u64) -> OrderBookEntry {
        OrderBookEntry {
            rate: Rate::from_units(rate),
            period: 2,
            amount: Amount::from_units(amount),
        }
    }

    fn fixture_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 9, 14, 15, 37, 11).unwrap()
    }

    /// Ask book shared by the task fixtures.
    fn fixture_book() -> OrderBook {
        OrderBook {
            bid: Vec::new(),
            ask: vec![
                ask(4_111_000_000, 16_000_000_000),
                ask(4_112_000_000, 20_200_000_000),
                ask(4_115_000_000, 134_177_000_000),
                ask(4_118_000_000, 53_400_000_000),
                ask(4_125_000_000, 78_800_000_000),
            ],
        }
    }

    fn fixture_credits(now: DateTime<Utc>) -> Vec<Credit> {
        vec![
            credit(100, 32_455_000_000, 7_321_000_000, now - ChronoDuration::hours(24)),
            credit(101, 2_441_355_000_000, 6_663_000_000, now - ChronoDuration::hours(23)),
            credit(102, 141_355_000_000, 8_934_000_000, now - ChronoDuration::hours(22)),
        ]
    }

    fn credits_sum(credits: &[Credit]) -> Amount {
        credits.iter().map(|c| c.loan.amount).sum()
    }

    #[test]
    fn test_total_borrow_with_and_without_balances() {
        let eng = test_engine();
        let positions = vec![
            position("BTCUST", 155_000_000, 211_000_000_000, true),
            position("BTCUSD", 452_000_000, 661_000_000_000, true),
            position("ADAUST", 1_355_000_000, 140_000_000_000, true),
            position("USTUSD", 2_334_000_000, 99_100_000, false),
        ];
        let balances = vec![balance("UST", 120_000_000), balance("USD", 11_100_000_000)];

        let with = eng.calculate_total_borrow(&positions, Some(&balances));
        assert_eq!(with.units(), 2_226_264_000_000);

        let without = eng.calculate_total_borrow(&positions, None);
        assert_eq!(without.units(), 2_226_384_000_000);

        // Balances only ever reduce the requirement.
        assert!(without >= with);
    }

    #[test]
    fn test_total_borrow_clamps_at_zero() {
        let eng = test_engine();
        let positions = vec![position("BTCUST", 100_000_000, 100_000_000, true)];
        let balances = vec![balance("UST", 10_000_000_000)];
        assert_eq!(
            eng.calculate_total_borrow(&positions, Some(&balances)),
            Amount::ZERO
        );
    }

    #[test]
    fn test_next_auto_loan_time() {
        let eng = test_engine();
        // 15:37:11 -> truncate 15:20 + 15m = 15:35, already passed -> 15:55.
        let next = eng.next_auto_loan_time(fixture_now());
        assert_eq!(next, Utc.with_ymd_and_hms(2021, 9, 14, 15, 55, 0).unwrap());
    }

    #[test]
    fn test_classify_credits_against_next_tick() {
        let eng = test_engine();
        let now = fixture_now();
        let credits = vec![
            // Expires at now + 3min = 15:40:11, before the 15:55 tick.
            credit(1, 100, 1, now - ChronoDuration::hours(48) + ChronoDuration::minutes(3)),
            // Expires tomorrow.
            credit(2, 100, 1, now - ChronoDuration::hours(24)),
        ];
        let (normal, to_expire) = eng.classify_credits(&credits, now);
        assert_eq!(to_expire.len(), 1);
        assert_eq!(to_expire[0].loan.id, 1);
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].loan.id, 2);
    }

    #[test]
    fn test_borrow_task_partial_displacement() {
        let eng = test_engine();
        let now = fixture_now();
        let credits = fixture_credits(now);
        let task =
            eng.make_borrow_task(&fixture_book(), &credits, credits_sum(&credits), 1.0, now);
        assert_eq!(task.total_borrow.units(), 173_810_000_000);
        assert_eq!(task.loan_ids_to_close, vec![102, 100]);
        assert_eq!(task.rate.units(), 4_125_000_000);
    }

    #[test]
    fn test_borrow_task_full_displacement() {
        let eng = test_engine();
        let now = fixture_now();
        let mut credits = fixture_credits(now);
        credits[1].loan.amount = Amount::from_units(128_767_000_000);
        let task =
            eng.make_borrow_task(&fixture_book(), &credits, credits_sum(&credits), 1.0, now);
        assert_eq!(task.total_borrow.units(), 302_577_000_000);
        assert_eq!(task.loan_ids_to_close, vec![102, 100, 101]);
        assert_eq!(task.rate.units(), 4_125_000_000);
    }

    #[test]
    fn test_borrow_task_expiring_credit_not_closed() {
        let eng = test_engine();
        let now = fixture_now();
        let yesterday = now - ChronoDuration::hours(24);
        let credits = vec![
            credit(200, 10_000_000_000, 8_000_000_000, yesterday),
            credit(201, 15_000_000_000, 7_500_000_000, yesterday),
            credit(202, 12_000_000_000, 7_000_000_000, yesterday),
            credit(203, 13_000_000_000, 6_500_000_000, yesterday),
            // Forcibly refinanced by the exchange this cycle.
            credit(
                204,
                20_000_000_000,
                5_000_000_000,
                now - ChronoDuration::hours(48) + ChronoDuration::minutes(3),
            ),
        ];
        let task =
            eng.make_borrow_task(&fixture_book(), &credits, credits_sum(&credits), 1.0, now);
        assert!(!task.loan_ids_to_close.contains(&204));
        assert_eq!(task.loan_ids_to_close, vec![200, 201, 202, 203]);
        // The expiring credit's amount is borrowed anyway.
        assert_eq!(task.total_borrow.units(), 70_000_000_000);
    }

    #[test]
    fn test_borrow_task_caps_at_book_depth() {
        let eng = test_engine();
        let now = fixture_now();
        let book = OrderBook {
            bid: Vec::new(),
            ask: vec![ask(4_111_000_000, 16_000_000_000)],
        };
        let credits = vec![
            credit(300, 10_000_000_000, 8_000_000_000, now - ChronoDuration::hours(24)),
            // Expiring, larger than the whole book.
            credit(
                302,
                50_000_000_000,
                5_000_000_000,
                now - ChronoDuration::hours(48) + ChronoDuration::minutes(3),
            ),
        ];
        let task = eng.make_borrow_task(&book, &credits, credits_sum(&credits), 1.0, now);
        // Only the fully backed credit is closed; the total caps at what
        // the single ask level supports.
        assert_eq!(task.loan_ids_to_close, vec![300]);
        assert_eq!(task.total_borrow.units(), 16_000_000_000);
        assert_eq!(task.rate.units(), 4_111_000_000);
    }

    #[test]
    fn test_failed_displacement_does_not_close_partially_backed_credit() {
        let eng = test_engine();
        let now = fixture_now();
        let book = OrderBook {
            bid: Vec::new(),
            ask: vec![ask(4_111_000_000, 16_000_000_000)],
        };
        let credits = vec![
            credit(300, 10_000_000_000, 8_000_000_000, now - ChronoDuration::hours(24)),
            // More than the residual 60 of liquidity; cannot be closed.
            credit(301, 12_000_000_000, 7_500_000_000, now - ChronoDuration::hours(24)),
        ];
        let task = eng.make_borrow_task(&book, &credits, credits_sum(&credits), 1.0, now);
        assert_eq!(task.loan_ids_to_close, vec![300]);
        assert_eq!(task.total_borrow.units(), 10_000_000_000);
    }

    #[test]
    fn test_borrow_task_tops_up_uncovered_exposure() {
        let eng = test_engine();
        let now = fixture_now();
        // No credits at all: the whole requirement comes from the book.
        let task = eng.make_borrow_task(
            &fixture_book(),
            &[],
            Amount::from_units(30_000_000_000),
            1.0,
            now,
        );
        assert!(task.loan_ids_to_close.is_empty());
        assert_eq!(task.total_borrow.units(), 30_000_000_000);
        // 300 fills 160 @ 4111, 140 @ 4112.
        assert_eq!(task.rate.units(), 4_112_000_000);
    }

    #[test]
    fn test_borrow_task_empty_book_is_noop() {
        let eng = test_engine();
        let now = fixture_now();
        let credits = fixture_credits(now);
        let task = eng.make_borrow_task(
            &OrderBook::new(),
            &credits,
            credits_sum(&credits),
            1.0,
            now,
        );
        assert!(task.is_empty());
        assert!(task.loan_ids_to_close.is_empty());
    }

    #[test]
    fn test_borrow_task_below_min_order_value_discarded() {
        let eng = test_engine();
        let now = fixture_now();
        let credits = fixture_credits(now);
        // 1738.1 UST at 0.01 USD is far below the 150 USD minimum.
        let task =
            eng.make_borrow_task(&fixture_book(), &credits, credits_sum(&credits), 0.01, now);
        assert!(task.is_empty());
    }

    #[test]
    fn test_no_displacement_when_credits_already_cheap() {
        let eng = test_engine();
        let now = fixture_now();
        // Credit rates at or below every ask rate.
        let credits = vec![
            credit(400, 10_000_000_000, 4_000_000_000, now - ChronoDuration::hours(24)),
            credit(401, 20_000_000_000, 4_111_000_000, now - ChronoDuration::hours(24)),
        ];
        let mut eng_zero = eng;
        eng_zero.config.min_rate_difference = 0.0;
        let task = eng_zero.make_borrow_task(
            &fixture_book(),
            &credits,
            credits_sum(&credits),
            1.0,
            now,
        );
        assert!(task.loan_ids_to_close.is_empty());
    }

    #[test]
    fn test_closed_ids_are_normal_and_covered() {
        let eng = test_engine();
        let now = fixture_now();
        let credits = fixture_credits(now);
        let task =
            eng.make_borrow_task(&fixture_book(), &credits, credits_sum(&credits), 1.0, now);
        let (normal, _) = eng.classify_credits(&credits, now);
        let normal_ids: Vec<u64> = normal.iter().map(|c| c.loan.id).collect();
        let closed_sum: Amount = credits
            .iter()
            .filter(|c| task.loan_ids_to_close.contains(&c.loan.id))
            .map(|c| c.loan.amount)
            .sum();
        assert!(task
            .loan_ids_to_close
            .iter()
            .all(|id| normal_ids.contains(id)));
        assert!(task.total_borrow >= closed_sum);
    }
}
