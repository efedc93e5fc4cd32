use std::fmt::{Display, Formatter};

/// Human readable state plus traffic counters for a connection or a driver
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Status {
    pub url: String,
    pub state: String,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub chirps_in: u64,
    pub chirps_out: u64,
}

impl Status {
    pub fn new(url: impl Into<String>, state: impl Into<String>) -> Status {
        Status {
            url: url.into(),
            state: state.into(),
            ..Default::default()
        }
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = state.into();
    }

    pub fn count_in(&mut self, num_bytes: usize) {
        self.messages_in += 1;
        self.bytes_in += num_bytes as u64;
    }

    pub fn count_out(&mut self, num_bytes: usize) {
        self.messages_out += 1;
        self.bytes_out += num_bytes as u64;
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] in: {} msgs / {} bytes, out: {} msgs / {} bytes",
               self.url, self.state, self.messages_in, self.bytes_in, self.messages_out, self.bytes_out)
    }
}
