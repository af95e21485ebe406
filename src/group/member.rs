//! Per-member bookkeeping inside a [`super::GroupMetadata`].

/// One consumer group member, as tracked between (and across) rebalances.
pub struct MemberMetadata {
    member_id: String,
    client_id: String,
    client_host: String,
    session_timeout_ms: i64,
    rebalance_timeout_ms: i64,
    /// In the member's own preference order; `select_protocol` walks this
    /// in order to cast the member's vote.
    supported_protocols: Vec<String>,
    /// Set by `mark_joined` when this member has checked in for the
    /// rebalance currently in progress; cleared implicitly at the start of
    /// a new one by the coordinator calling `mark_joined` again.
    joined: bool,
    assignment: Vec<u8>,
}

impl MemberMetadata {
    pub fn new(
        member_id: impl Into<String>,
        client_id: impl Into<String>,
        client_host: impl Into<String>,
        session_timeout_ms: i64,
        rebalance_timeout_ms: i64,
        supported_protocols: Vec<String>,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            client_id: client_id.into(),
            client_host: client_host.into(),
            session_timeout_ms,
            rebalance_timeout_ms,
            supported_protocols,
            joined: false,
            assignment: Vec::new(),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_host(&self) -> &str {
        &self.client_host
    }

    pub fn session_timeout_ms(&self) -> i64 {
        self.session_timeout_ms
    }

    pub fn rebalance_timeout_ms(&self) -> i64 {
        self.rebalance_timeout_ms
    }

    pub fn supported_protocols(&self) -> &[String] {
        &self.supported_protocols
    }

    pub fn set_supported_protocols(&mut self, protocols: Vec<String>) {
        self.supported_protocols = protocols;
    }

    pub fn has_joined(&self) -> bool {
        self.joined
    }

    pub fn mark_joined(&mut self) {
        self.joined = true;
    }

    pub fn reset_joined(&mut self) {
        self.joined = false;
    }

    pub fn assignment(&self) -> &[u8] {
        &self.assignment
    }

    pub fn set_assignment(&mut self, assignment: Vec<u8>) {
        self.assignment = assignment;
    }

    /// Whether `protocol` is something this member can speak at all, i.e.
    /// a candidate `select_protocol` may consider when intersecting across
    /// the whole group.
    pub fn supports(&self, protocol: &str) -> bool {
        self.supported_protocols.iter().any(|p| p == protocol)
    }
}
