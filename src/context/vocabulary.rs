//! Per-language keyword vocabularies.
//!
//! Each language contributes its own word lists; the extractor unions every
//! vocabulary, so a mixed-script question is matched against all of them.
//! Keywords made of ASCII are matched as whole words or phrases; others are
//! matched as substrings (CJK text carries no spaces).

use super::{AggregationKind, BusinessIntent, Operation};

pub struct Vocabulary {
    pub language: &'static str,
    pub entities: &'static [&'static str],
    pub attributes: &'static [&'static str],
    pub operations: &'static [(Operation, &'static [&'static str])],
    pub aggregations: &'static [(AggregationKind, &'static [&'static str])],
    pub temporal: &'static [&'static str],
    /// Checked in order, first bucket with a hit wins
    pub intents: &'static [(BusinessIntent, &'static [&'static str])],
}

pub static ENGLISH: Vocabulary = Vocabulary {
    language: "en",
    entities: &[
        "customer", "customers", "client", "clients", "user", "users", "account", "accounts",
        "order", "orders", "product", "products", "item", "items", "sale", "sales",
        "employee", "employees", "invoice", "invoices", "payment", "payments",
        "transaction", "transactions", "supplier", "suppliers", "vendor", "vendors",
        "category", "categories", "inventory", "shipment", "shipments", "department",
        "departments", "store", "stores",
    ],
    attributes: &[
        "name", "email", "phone", "address", "country", "city", "region", "state",
        "price", "amount", "quantity", "revenue", "cost", "status", "date", "age",
        "salary", "rating", "category", "description", "type", "created_at", "updated_at",
    ],
    operations: &[
        (Operation::Select, &["show", "list", "display", "get", "find", "what", "which", "give", "fetch", "retrieve"]),
        (Operation::Filter, &["where", "whose", "with", "only", "filter", "without", "excluding"]),
        (Operation::Sort, &["sort", "sorted", "order by", "top", "highest", "lowest", "rank", "latest", "newest", "oldest"]),
        (Operation::Group, &["by", "per", "each", "group", "grouped", "breakdown"]),
        (Operation::Join, &["join", "along with", "together with", "and their", "combined with"]),
        (Operation::Aggregate, &["count", "total", "sum", "average", "avg", "mean", "how many", "number of", "maximum", "minimum"]),
    ],
    aggregations: &[
        (AggregationKind::Count, &["count", "how many", "number of"]),
        (AggregationKind::Sum, &["sum", "total"]),
        (AggregationKind::Average, &["average", "avg", "mean"]),
        (AggregationKind::Max, &["max", "maximum", "highest", "largest", "most"]),
        (AggregationKind::Min, &["min", "minimum", "lowest", "smallest", "least"]),
    ],
    temporal: &[
        "today", "yesterday", "tomorrow", "this week", "this month", "this year", "this quarter",
        "last week", "last month", "last year", "last quarter", "daily", "weekly", "monthly",
        "yearly", "quarterly",
    ],
    intents: &[
        (BusinessIntent::Reporting, &["report", "summary", "summarize", "overview", "dashboard"]),
        (BusinessIntent::Analytics, &["analyze", "analyse", "analysis", "trend", "trends", "compare", "correlation", "distribution"]),
        (BusinessIntent::Lookup, &["show", "find", "get", "lookup", "look up", "list", "display", "who", "which"]),
        (BusinessIntent::Monitoring, &["monitor", "alert", "track", "tracking", "health", "failing"]),
        (BusinessIntent::Optimization, &["optimize", "optimise", "improve", "reduce", "performance", "efficiency"]),
    ],
};

pub static CHINESE: Vocabulary = Vocabulary {
    language: "zh",
    entities: &["客户", "顾客", "用户", "订单", "产品", "商品", "员工", "供应商", "付款", "交易", "部门"],
    attributes: &["名称", "姓名", "邮箱", "电话", "地址", "国家", "城市", "地区", "价格", "金额", "数量", "状态", "日期"],
    operations: &[
        (Operation::Select, &["显示", "查询", "列出", "查找", "哪些"]),
        (Operation::Filter, &["其中", "筛选", "只", "大于", "小于"]),
        (Operation::Sort, &["排序", "最高", "最低", "前"]),
        (Operation::Group, &["按", "每", "分组"]),
        (Operation::Join, &["关联", "以及"]),
        (Operation::Aggregate, &["统计", "总数", "合计", "平均", "多少"]),
    ],
    aggregations: &[
        (AggregationKind::Count, &["数量", "多少", "总数", "个数"]),
        (AggregationKind::Sum, &["总和", "合计", "总额"]),
        (AggregationKind::Average, &["平均"]),
        (AggregationKind::Max, &["最大", "最高"]),
        (AggregationKind::Min, &["最小", "最低"]),
    ],
    temporal: &["今天", "昨天", "明天", "本周", "本月", "今年", "上周", "上个月", "去年", "季度"],
    intents: &[
        (BusinessIntent::Reporting, &["报告", "报表", "汇总"]),
        (BusinessIntent::Analytics, &["分析", "趋势", "比较"]),
        (BusinessIntent::Lookup, &["显示", "查找", "查询", "列出"]),
        (BusinessIntent::Monitoring, &["监控", "告警", "跟踪"]),
        (BusinessIntent::Optimization, &["优化", "改进", "提升"]),
    ],
};

pub static ALL: &[&Vocabulary] = &[&ENGLISH, &CHINESE];

/// Words that look like plurals but never name a table
pub static NOT_PLURAL: &[&str] = &[
    "this", "that", "is", "was", "has", "does", "its", "his", "hers", "yes", "us", "as",
    "less", "across", "plus", "always", "thus", "unless", "status", "analysis", "address",
    "business", "process", "access", "class", "news", "various", "previous", "whereas",
    "days", "weeks", "months", "years", "hours", "minutes", "details", "results", "numbers",
    "totals", "things", "stuffs", "rows", "records", "values", "trends",
];

/// Words that never become entities, attributes or filter fields
pub static STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "in", "on", "for", "to", "from", "with", "by", "and", "or", "me",
    "my", "all", "any", "some", "show", "list", "get", "find", "what", "which", "who", "how",
    "many", "much", "is", "are", "was", "were", "be", "have", "has", "that", "this", "than",
    "more", "less", "over", "under", "above", "below", "where", "whose", "give", "display",
    "please", "total", "count", "number", "their", "there", "it", "at", "as", "per", "each",
    "only", "not", "no", "stuff",
];
