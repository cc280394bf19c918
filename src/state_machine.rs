/// Lifecycle of one device conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// 设备握手与上游连接同时进行
    Connecting,
    /// 发送 session.update
    SessionInitializing,
    /// 合流循环运行中
    Active,
    /// 释放录音、工具执行器与上游连接
    Closing,
}

impl AgentState {
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Connecting, SessionInitializing)
                | (SessionInitializing, Active)
                | (Connecting, Closing)
                | (SessionInitializing, Closing)
                | (Active, Closing)
        )
    }
}
