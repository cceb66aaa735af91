pub mod discord;
pub mod gmail;
pub mod signal;
pub mod telegram;
pub mod whatsapp;

pub use discord::DiscordAdapter;
pub use gmail::GmailAdapter;
pub use signal::SignalAdapter;
pub use telegram::TelegramAdapter;
pub use whatsapp::WhatsappAdapter;
