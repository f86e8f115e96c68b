use std::fmt;
use std::str::FromStr;

/// Inline-button payloads. Encoded with `Display`, decoded with `FromStr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    MainMenu,
    Tariffs,
    Tariff(String),
    Pay(String),
    Trial,
    ConfirmPayment(i64),
    CancelPayment(i64),
    Link,
    Status,
    Referrals,
    Profile,
    Help,
    Admin(AdminCallback),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCallback {
    Menu,
    Stats,
    Payments,
    Payment(i64),
    Approve(i64),
    Reject(i64),
    Search,
    User(i64),
    Ban(i64),
    Unban(i64),
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCallback(pub String);

impl fmt::Display for UnknownCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown callback payload {:?}", self.0)
    }
}

impl std::error::Error for UnknownCallback {}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::MainMenu => f.write_str("menu"),
            Callback::Tariffs => f.write_str("tariffs"),
            Callback::Tariff(id) => write!(f, "tariff:{}", id),
            Callback::Pay(id) => write!(f, "pay:{}", id),
            Callback::Trial => f.write_str("trial"),
            Callback::ConfirmPayment(id) => write!(f, "confirm:{}", id),
            Callback::CancelPayment(id) => write!(f, "cancel:{}", id),
            Callback::Link => f.write_str("link"),
            Callback::Status => f.write_str("status"),
            Callback::Referrals => f.write_str("referrals"),
            Callback::Profile => f.write_str("profile"),
            Callback::Help => f.write_str("help"),
            Callback::Admin(a) => write!(f, "adm:{}", a),
        }
    }
}

impl fmt::Display for AdminCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminCallback::Menu => f.write_str("menu"),
            AdminCallback::Stats => f.write_str("stats"),
            AdminCallback::Payments => f.write_str("payments"),
            AdminCallback::Payment(id) => write!(f, "payment:{}", id),
            AdminCallback::Approve(id) => write!(f, "approve:{}", id),
            AdminCallback::Reject(id) => write!(f, "reject:{}", id),
            AdminCallback::Search => f.write_str("search"),
            AdminCallback::User(id) => write!(f, "user:{}", id),
            AdminCallback::Ban(id) => write!(f, "ban:{}", id),
            AdminCallback::Unban(id) => write!(f, "unban:{}", id),
            AdminCallback::Broadcast => f.write_str("broadcast"),
        }
    }
}

fn parse_id(raw: Option<&str>, whole: &str) -> Result<i64, UnknownCallback> {
    raw.and_then(|s| s.parse().ok())
        .ok_or_else(|| UnknownCallback(whole.to_string()))
}

impl FromStr for AdminCallback {
    type Err = UnknownCallback;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, arg) = match s.split_once(':') {
            Some((h, a)) => (h, Some(a)),
            None => (s, None),
        };
        let cb = match (head, arg) {
            ("menu", None) => AdminCallback::Menu,
            ("stats", None) => AdminCallback::Stats,
            ("payments", None) => AdminCallback::Payments,
            ("payment", a) => AdminCallback::Payment(parse_id(a, s)?),
            ("approve", a) => AdminCallback::Approve(parse_id(a, s)?),
            ("reject", a) => AdminCallback::Reject(parse_id(a, s)?),
            ("search", None) => AdminCallback::Search,
            ("user", a) => AdminCallback::User(parse_id(a, s)?),
            ("ban", a) => AdminCallback::Ban(parse_id(a, s)?),
            ("unban", a) => AdminCallback::Unban(parse_id(a, s)?),
            ("broadcast", None) => AdminCallback::Broadcast,
            _ => return Err(UnknownCallback(s.to_string())),
        };
        Ok(cb)
    }
}

impl FromStr for Callback {
    type Err = UnknownCallback;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("adm:") {
            return rest
                .parse()
                .map(Callback::Admin)
                .map_err(|_| UnknownCallback(s.to_string()));
        }
        let (head, arg) = match s.split_once(':') {
            Some((h, a)) => (h, Some(a)),
            None => (s, None),
        };
        let cb = match (head, arg) {
            ("menu", None) => Callback::MainMenu,
            ("tariffs", None) => Callback::Tariffs,
            ("tariff", Some(id)) if !id.is_empty() => Callback::Tariff(id.to_string()),
            ("pay", Some(id)) if !id.is_empty() => Callback::Pay(id.to_string()),
            ("trial", None) => Callback::Trial,
            ("confirm", a) => Callback::ConfirmPayment(parse_id(a, s)?),
            ("cancel", a) => Callback::CancelPayment(parse_id(a, s)?),
            ("link", None) => Callback::Link,
            ("status", None) => Callback::Status,
            ("referrals", None) => Callback::Referrals,
            ("profile", None) => Callback::Profile,
            ("help", None) => Callback::Help,
            _ => return Err(UnknownCallback(s.to_string())),
        };
        Ok(cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_user_and_admin_payloads() {
        assert_eq!("confirm:12".parse::<Callback>().unwrap(), Callback::ConfirmPayment(12));
        assert_eq!("pay:basic".parse::<Callback>().unwrap(), Callback::Pay("basic".into()));
        assert_eq!(
            "adm:approve:3".parse::<Callback>().unwrap(),
            Callback::Admin(AdminCallback::Approve(3))
        );
        assert_eq!(Callback::Admin(AdminCallback::Unban(77)).to_string(), "adm:unban:77");
    }

    #[test]
    fn longest_payloads_fit_telegram_limit() {
        let tariff = Callback::Tariff("x".repeat(32)).to_string();
        assert!(tariff.len() <= 64);
        let admin = Callback::Admin(AdminCallback::Payment(i64::MAX)).to_string();
        assert!(admin.len() <= 64);
    }

    #[test]
    fn garbage_is_rejected() {
        for raw in ["", "nope", "confirm:", "confirm:abc", "adm:approve", "adm:what", "tariff:", "menu:1"] {
            assert!(raw.parse::<Callback>().is_err(), "{} should not parse", raw);
        }
    }
}
