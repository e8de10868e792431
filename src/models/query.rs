/// 一次筛选的检索条件
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// 研究问题
    pub question: String,
    /// 关键词（英文逗号分隔）
    pub keywords: String,
    /// 额外筛选要求
    pub requirements: String,
}

impl Query {
    pub fn new(
        question: impl Into<String>,
        keywords: impl Into<String>,
        requirements: impl Into<String>,
    ) -> Self {
        Self {
            question: question.into(),
            keywords: keywords.into(),
            requirements: requirements.into(),
        }
    }
}
