use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::conversation::{ConversationSession, Role};

/// Line-oriented chat about one book. `/reset`, `/history` and `/quit` are
/// commands; any other non-empty line is sent.
pub struct ChatRepl<'a> {
    session: &'a ConversationSession,
    shown: usize,
}

impl<'a> ChatRepl<'a> {
    pub fn new(session: &'a ConversationSession) -> Self {
        Self { session, shown: 0 }
    }

    pub async fn run<R, W>(&mut self, input: R, mut out: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = self.session.resolve().await {
            out.write_all(format!("Cannot open conversation: {e}\n").as_bytes()).await?;
            out.flush().await?;
            return Err(e.into());
        }
        if let Some(book) = self.session.book() {
            let header = format!(
                "Chatting about '{}' by {}. Commands: /history /reset /quit\n",
                book.book_name, book.author_name
            );
            out.write_all(header.as_bytes()).await?;
        }
        self.session.auto_seed().await;
        self.flush_transcript(&mut out).await?;

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            match line.trim() {
                "" => continue,
                "/quit" => break,
                "/history" => self.print_history(&mut out).await?,
                "/reset" => {
                    self.session.reset();
                    self.shown = 0;
                    out.write_all(b"-- conversation cleared --\n").await?;
                    self.session.auto_seed().await;
                    self.flush_transcript(&mut out).await?;
                }
                text => {
                    self.session.send(text).await;
                    self.flush_transcript(&mut out).await?;
                }
            }
        }
        out.flush().await?;
        Ok(())
    }

    async fn flush_transcript<W: AsyncWrite + Unpin>(&mut self, out: &mut W) -> anyhow::Result<()> {
        let transcript = self.session.transcript();
        let you = self.session.settings().display_name.unwrap_or_else(|| "you".to_string());
        for m in transcript.iter().skip(self.shown) {
            let who = match m.role {
                Role::User => you.as_str(),
                Role::Assistant => "assistant",
            };
            out.write_all(format!("{who}> {}\n", m.content).as_bytes()).await?;
        }
        self.shown = transcript.len();
        out.flush().await?;
        Ok(())
    }

    async fn print_history<W: AsyncWrite + Unpin>(&self, out: &mut W) -> anyhow::Result<()> {
        let history = self.session.history();
        if history.is_empty() {
            out.write_all(b"(no answered questions yet)\n").await?;
        }
        for (i, entry) in history.iter().enumerate() {
            out.write_all(format!("{}. Q: {}\n   A: {}\n", i + 1, entry.question, entry.answer).as_bytes()).await?;
        }
        Ok(())
    }
}
